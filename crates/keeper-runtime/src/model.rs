//! Model presence checks and pulls through the runtime CLI.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{RuntimeConfig, RUNTIME_HOST_ENV};
use crate::error::ModelError;
use crate::logs::{self, StreamOrigin};

/// State of a model artifact, derived on demand from the runtime's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelState {
    NotPresent,
    /// A pull is running; carries the latest progress line.
    Downloading(String),
    Ready,
    Failed(String),
}

/// Checks for and pulls model artifacts by invoking the runtime binary.
pub struct ModelProvisioner {
    binary: PathBuf,
    host_value: String,
    list_timeout: Duration,
    pull_timeout: Duration,
}

impl ModelProvisioner {
    pub fn new(config: &RuntimeConfig, binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            host_value: config.runtime_host_value(),
            list_timeout: config.list_timeout,
            pull_timeout: config.pull_timeout,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .env(RUNTIME_HOST_ENV, &self.host_value)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Names of all models known to the runtime.
    pub async fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let output = timeout(self.list_timeout, self.command().arg("list").output())
            .await
            .map_err(|_| ModelError::ListFailed(format!("timed out after {:?}", self.list_timeout)))?
            .map_err(|e| ModelError::ListFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ModelError::ListFailed(format!(
                "{}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(parse_model_list(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Whether `model` is registered with the runtime.
    pub async fn is_present(&self, model: &str) -> bool {
        match self.list_models().await {
            Ok(models) => models.iter().any(|m| model_matches(m, model)),
            Err(e) => {
                warn!("Could not check for model '{}': {}", model, e);
                false
            }
        }
    }

    /// Current state of `model`.
    pub async fn status(&self, model: &str) -> ModelState {
        match self.list_models().await {
            Ok(models) if models.iter().any(|m| model_matches(m, model)) => ModelState::Ready,
            Ok(_) => ModelState::NotPresent,
            Err(e) => ModelState::Failed(e.to_string()),
        }
    }

    /// Make sure `model` is present, pulling it if needed.
    ///
    /// Every pull output line is passed to `on_progress` as
    /// [`ModelState::Downloading`], in order.
    pub async fn ensure_ready<F>(&self, model: &str, mut on_progress: F) -> Result<(), ModelError>
    where
        F: FnMut(&ModelState) + Send,
    {
        if self.is_present(model).await {
            debug!("Model '{}' already present", model);
            return Ok(());
        }

        info!("Pulling model: {}", model);
        let pull_failed = |reason: String| ModelError::PullFailed {
            model: model.to_string(),
            reason,
        };

        let mut child = self
            .command()
            .arg("pull")
            .arg(model)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| pull_failed(e.to_string()))?;
        let pid = child.id();

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_segments(stdout, StreamOrigin::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_segments(stderr, StreamOrigin::Stderr, tx));
        }

        let mut last_error: Option<String> = None;
        let relay = async {
            while let Some((origin, line)) = rx.recv().await {
                if logs::emit("pull", pid, origin, &line) == logs::LogLevel::Error {
                    last_error = Some(line.clone());
                }
                on_progress(&ModelState::Downloading(line));
            }
            child.wait().await
        };
        let outcome = timeout(self.pull_timeout, relay).await;

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(pull_failed(e.to_string())),
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(pull_failed(format!("timed out after {:?}", self.pull_timeout)));
            }
        };

        // The listing, not the exit code, decides.
        let present = self.is_present(model).await;
        match (present, status.success()) {
            (true, true) => {
                info!("Model '{}' is ready", model);
                Ok(())
            }
            (true, false) => {
                warn!("Pull exited with {} but model '{}' is listed", status, model);
                Ok(())
            }
            (false, false) => Err(pull_failed(
                last_error.unwrap_or_else(|| format!("pull exited with {}", status)),
            )),
            (false, true) => Err(ModelError::NotFoundAfterPull(model.to_string())),
        }
    }
}

/// Forward output split on `\n` and `\r`, ANSI-stripped and trimmed.
async fn forward_segments<R>(
    mut stream: R,
    origin: StreamOrigin,
    tx: mpsc::UnboundedSender<(StreamOrigin, String)>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    let flush = |pending: &mut Vec<u8>| -> Option<String> {
        let text = logs::strip_ansi(&String::from_utf8_lossy(pending));
        pending.clear();
        let text = text.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    };

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Pull {} read error: {}", origin.as_str(), e);
                break;
            }
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = flush(&mut pending) {
                    if tx.send((origin, line)).is_err() {
                        return;
                    }
                }
            } else {
                pending.push(byte);
            }
        }
    }

    if let Some(line) = flush(&mut pending) {
        let _ = tx.send((origin, line));
    }
}

/// Parse `list` output: first column of every row after the header.
pub fn parse_model_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| !name.eq_ignore_ascii_case("NAME"))
        .map(str::to_string)
        .collect()
}

/// `demo` matches `demo:latest` and any other tag; `demo:7b` only matches itself.
pub fn model_matches(listed: &str, wanted: &str) -> bool {
    if listed == wanted {
        return true;
    }
    if wanted.contains(':') {
        return false;
    }
    listed
        .strip_prefix(wanted)
        .map(|rest| rest.starts_with(':'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_list() {
        let out = "NAME              ID              SIZE      MODIFIED\n\
                   gemma3:1b         8648f39daa8f    815 MB    2 days ago\n\
                   llama3.2:latest   a80c4f17acd5    2.0 GB    3 weeks ago\n";
        assert_eq!(parse_model_list(out), vec!["gemma3:1b", "llama3.2:latest"]);
        assert!(parse_model_list("NAME ID SIZE MODIFIED\n").is_empty());
    }

    #[test]
    fn test_model_matching() {
        assert!(model_matches("gemma3:1b", "gemma3:1b"));
        assert!(model_matches("demo-model:latest", "demo-model"));
        assert!(!model_matches("demo-model-large:latest", "demo-model"));
        assert!(!model_matches("gemma3:4b", "gemma3:1b"));
    }

    #[cfg(unix)]
    mod scripted {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::{tempdir, TempDir};

        const FAKE_RUNTIME: &str = r#"#!/bin/sh
DIR="$(dirname "$0")"
case "$1" in
  list)
    echo "NAME                 ID              SIZE      MODIFIED"
    if [ -f "$DIR/pulled" ]; then
      echo "demo-model:latest    abc123def456    1.2 GB    1 second ago"
    fi
    ;;
  pull)
    PULL_BODY
    ;;
esac
"#;

        fn fake_runtime(pull_body: &str) -> (TempDir, ModelProvisioner) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("ollama");
            std::fs::write(&path, FAKE_RUNTIME.replace("PULL_BODY", pull_body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            let provisioner = ModelProvisioner::new(&RuntimeConfig::default(), path);
            (dir, provisioner)
        }

        #[tokio::test]
        async fn test_pull_relays_progress_in_order() {
            let (_dir, provisioner) = fake_runtime(
                "echo \"pulling manifest\"; echo \"50%\"; echo \"success\"; touch \"$DIR/pulled\"",
            );
            assert!(!provisioner.is_present("demo-model").await);
            assert_eq!(provisioner.status("demo-model").await, ModelState::NotPresent);

            let mut seen = Vec::new();
            provisioner
                .ensure_ready("demo-model", |state| seen.push(state.clone()))
                .await
                .unwrap();

            assert_eq!(
                seen,
                vec![
                    ModelState::Downloading("pulling manifest".into()),
                    ModelState::Downloading("50%".into()),
                    ModelState::Downloading("success".into()),
                ]
            );
            assert_eq!(provisioner.status("demo-model").await, ModelState::Ready);
        }

        #[tokio::test]
        async fn test_carriage_return_progress_is_split() {
            let (_dir, provisioner) = fake_runtime(
                "printf 'pulling abc 10%%\\rpulling abc 90%%\\r\\n' >&2; touch \"$DIR/pulled\"",
            );
            let mut seen = Vec::new();
            provisioner
                .ensure_ready("demo-model", |state| seen.push(state.clone()))
                .await
                .unwrap();
            assert_eq!(seen.len(), 2);
        }

        #[tokio::test]
        async fn test_present_model_skips_pull() {
            let (dir, provisioner) = fake_runtime("exit 9");
            std::fs::write(dir.path().join("pulled"), "").unwrap();

            let mut calls = 0;
            provisioner
                .ensure_ready("demo-model", |_| calls += 1)
                .await
                .unwrap();
            assert_eq!(calls, 0);
        }

        #[tokio::test]
        async fn test_failed_pull() {
            let (_dir, provisioner) =
                fake_runtime("echo 'Error: pull model manifest: file does not exist' >&2; exit 1");
            let err = provisioner.ensure_ready("demo-model", |_| {}).await.unwrap_err();
            match err {
                ModelError::PullFailed { reason, .. } => assert!(reason.contains("does not exist")),
                other => panic!("unexpected error: {}", other),
            }
        }

        #[tokio::test]
        async fn test_clean_exit_without_model() {
            let (_dir, provisioner) = fake_runtime("echo success");
            let err = provisioner.ensure_ready("demo-model", |_| {}).await.unwrap_err();
            assert!(matches!(err, ModelError::NotFoundAfterPull(_)));
        }

        #[tokio::test]
        async fn test_listed_model_wins_over_exit_code() {
            let (_dir, provisioner) = fake_runtime("touch \"$DIR/pulled\"; exit 2");
            provisioner.ensure_ready("demo-model", |_| {}).await.unwrap();
        }
    }
}
