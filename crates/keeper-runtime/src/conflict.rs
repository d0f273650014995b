//! Port conflict arbitration.
//!
//! Only processes whose command line references the managed binary, or whose
//! PID is our own managed process, are ever signalled. Anything else holding
//! the port is reported and left running.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::ConflictError;
use crate::health::HealthCheck;
use crate::port::{is_port_available, wait_for_port_release};
use crate::process::{ProcessTable, Termination};

/// Who a process belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Runs the managed binary, or is our managed process.
    Ours,
    /// Anything else. Never terminated.
    Foreign,
}

/// A process found holding (or related to) the runtime port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub pid: u32,
    pub command_line: String,
    pub classification: Classification,
}

/// What preflight found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// Service healthy or port free.
    NoConflict,
    /// Stale processes of ours were terminated and the port is free again.
    Resolved(Vec<ConflictRecord>),
}

/// Frees the runtime port from stale instances of the managed binary.
pub struct ConflictResolver {
    table: Arc<dyn ProcessTable>,
    binary: PathBuf,
    host: String,
    port: u16,
    kill_grace: Duration,
    release_timeout: Duration,
}

impl ConflictResolver {
    pub fn new(config: &RuntimeConfig, binary: impl Into<PathBuf>, table: Arc<dyn ProcessTable>) -> Self {
        Self {
            table,
            binary: binary.into(),
            host: config.host.clone(),
            port: config.port,
            kill_grace: config.conflict_kill_grace,
            release_timeout: config.port_release_timeout,
        }
    }

    /// The managed binary path used for classification.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Classify one process.
    pub fn classify(&self, pid: u32, command_line: &str, own_pid: Option<u32>) -> Classification {
        if pid == std::process::id() {
            return Classification::Foreign;
        }
        if own_pid == Some(pid) {
            return Classification::Ours;
        }
        let binary = self.binary.to_string_lossy();
        if !binary.is_empty() && command_line.contains(binary.as_ref()) {
            Classification::Ours
        } else {
            Classification::Foreign
        }
    }

    /// Inspect the port and terminate stale instances of ours if needed.
    pub async fn resolve(
        &self,
        health: &dyn HealthCheck,
        own_pid: Option<u32>,
    ) -> Result<ConflictOutcome, ConflictError> {
        if health.check_once().await.ready {
            return Ok(ConflictOutcome::NoConflict);
        }
        if is_port_available(&self.host, self.port) {
            return Ok(ConflictOutcome::NoConflict);
        }

        let pids = self.table.pids_on_port(self.port);
        if pids.is_empty() {
            warn!("Port {} is occupied but no owner was found", self.port);
            return Err(ConflictError::UnidentifiedOccupant(self.port));
        }

        let records: Vec<ConflictRecord> = pids
            .into_iter()
            .map(|pid| {
                let command_line = self
                    .table
                    .command_line(pid)
                    .unwrap_or_else(|| "<unknown>".to_string());
                let classification = self.classify(pid, &command_line, own_pid);
                ConflictRecord {
                    pid,
                    command_line,
                    classification,
                }
            })
            .collect();

        if let Some(foreign) = records
            .iter()
            .find(|r| r.classification == Classification::Foreign)
        {
            warn!(
                "Port {} held by foreign process {} ({}); leaving it alone",
                self.port, foreign.pid, foreign.command_line
            );
            return Err(ConflictError::UnresolvedForeignOccupant {
                port: self.port,
                pid: foreign.pid,
                command: foreign.command_line.clone(),
            });
        }

        for record in &records {
            info!(
                "Terminating stale runtime process {} ({})",
                record.pid, record.command_line
            );
            self.terminate(record.pid, false).await;
        }

        if wait_for_port_release(&self.host, self.port, self.release_timeout).await {
            info!("Port {} released", self.port);
            Ok(ConflictOutcome::Resolved(records))
        } else {
            Err(ConflictError::KillFailed {
                port: self.port,
                reason: format!("port still busy after {:?}", self.release_timeout),
            })
        }
    }

    /// Every running process of ours other than `own_pid`, regardless of port.
    pub fn find_orphans(&self, own_pid: Option<u32>) -> Vec<ConflictRecord> {
        self.table
            .processes()
            .into_iter()
            .filter(|p| Some(p.pid) != own_pid)
            .filter_map(|p| {
                match self.classify(p.pid, &p.command_line, None) {
                    Classification::Ours => Some(ConflictRecord {
                        pid: p.pid,
                        command_line: p.command_line,
                        classification: Classification::Ours,
                    }),
                    Classification::Foreign => None,
                }
            })
            .collect()
    }

    /// Terminate records classified as ours. Foreign records are skipped.
    pub async fn terminate_all(&self, records: &[ConflictRecord], forced: bool) {
        for record in records {
            if record.classification != Classification::Ours {
                debug!("Not terminating foreign process {}", record.pid);
                continue;
            }
            self.terminate(record.pid, forced).await;
        }
    }

    /// Graceful signal, wait, then forced signal if still alive.
    async fn terminate(&self, pid: u32, forced: bool) {
        if !forced {
            if let Err(e) = self.table.terminate(pid, Termination::Graceful) {
                debug!("Graceful signal to {} failed: {}", pid, e);
            }
            if self.wait_for_exit(pid, self.kill_grace).await {
                return;
            }
            warn!("Process {} ignored graceful stop, killing", pid);
        }

        if let Err(e) = self.table.terminate(pid, Termination::Forced) {
            debug!("Forced signal to {} failed: {}", pid, e);
        }
        self.wait_for_exit(pid, Duration::from_millis(500)).await;
    }

    async fn wait_for_exit(&self, pid: u32, limit: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.table.is_alive(pid) {
                return true;
            }
            if start.elapsed() >= limit {
                return false;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthReport;
    use crate::testing::FakeTable;
    use async_trait::async_trait;
    use std::net::TcpListener;

    struct NeverReady;

    #[async_trait]
    impl HealthCheck for NeverReady {
        async fn check_once(&self) -> HealthReport {
            HealthReport::not_ready("port unreachable")
        }

        fn retry_delay(&self) -> Duration {
            Duration::from_millis(1)
        }
    }

    const BINARY: &str = "/home/u/.ollama/bin/ollama";

    fn occupied(table: &FakeTable, pids: &[u32]) -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        *table.on_port.lock().unwrap() = pids.to_vec();
        *table.holder.lock().unwrap() = Some(listener);
        port
    }

    fn resolver(table: Arc<FakeTable>, port: u16) -> ConflictResolver {
        let config = RuntimeConfig::builder()
            .port(port)
            .conflict_kill_grace(Duration::from_millis(100))
            .port_release_timeout(Duration::from_secs(2))
            .build();
        ConflictResolver::new(&config, BINARY, table)
    }

    #[test]
    fn test_classification() {
        let table = Arc::new(FakeTable::default());
        let r = resolver(table, 1);
        assert_eq!(r.classify(10, &format!("{} serve", BINARY), None), Classification::Ours);
        assert_eq!(r.classify(11, "/usr/bin/python -m http.server", None), Classification::Foreign);
        assert_eq!(r.classify(12, "/usr/bin/python", Some(12)), Classification::Ours);
        assert_eq!(
            r.classify(std::process::id(), &format!("{} serve", BINARY), None),
            Classification::Foreign
        );
    }

    #[tokio::test]
    async fn test_free_port_is_no_conflict() {
        let table = Arc::new(FakeTable::default());
        let port = {
            let l = TcpListener::bind(("127.0.0.1", 0)).unwrap();
            l.local_addr().unwrap().port()
        };
        let outcome = resolver(table.clone(), port).resolve(&NeverReady, None).await.unwrap();
        assert_eq!(outcome, ConflictOutcome::NoConflict);
        assert!(table.kills().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_occupants_are_never_killed() {
        let listings: &[&[(u32, &str)]] = &[
            &[(100, "/usr/sbin/nginx -g daemon off;")],
            &[(200, "/opt/other/ollama serve"), (201, "node server.js")],
            &[(300, "")],
        ];

        for entries in listings {
            let table = Arc::new(FakeTable::with(entries));
            let pids: Vec<u32> = entries.iter().map(|(pid, _)| *pid).collect();
            let port = occupied(&table, &pids);

            let err = resolver(table.clone(), port)
                .resolve(&NeverReady, Some(999))
                .await
                .unwrap_err();
            assert!(matches!(err, ConflictError::UnresolvedForeignOccupant { .. }));
            assert!(table.kills().is_empty(), "killed {:?}", table.kills());
        }
    }

    #[tokio::test]
    async fn test_mixed_occupants_kill_nothing() {
        let ours = format!("{} serve", BINARY);
        let table = Arc::new(FakeTable::with(&[
            (400, ours.as_str()),
            (401, "/usr/bin/redis-server"),
        ]));
        let port = occupied(&table, &[400, 401]);

        let result = resolver(table.clone(), port).resolve(&NeverReady, None).await;
        assert!(result.is_err());
        assert!(table.kills().is_empty());
    }

    #[tokio::test]
    async fn test_stale_own_process_is_terminated() {
        let ours = format!("{} serve", BINARY);
        let table = Arc::new(FakeTable::with(&[(500, ours.as_str())]));
        let port = occupied(&table, &[500]);

        let outcome = resolver(table.clone(), port).resolve(&NeverReady, None).await.unwrap();
        match outcome {
            ConflictOutcome::Resolved(records) => assert_eq!(records[0].pid, 500),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(table.kills(), vec![(500, Termination::Graceful)]);
    }

    #[tokio::test]
    async fn test_unidentified_occupant() {
        let table = Arc::new(FakeTable::default());
        let port = occupied(&table, &[]);
        let err = resolver(table.clone(), port).resolve(&NeverReady, None).await.unwrap_err();
        assert!(matches!(err, ConflictError::UnidentifiedOccupant(p) if p == port));
    }

    #[test]
    fn test_find_orphans_skips_foreign_and_own() {
        let serve = format!("{} serve", BINARY);
        let runner = format!("{} runner --model x", BINARY);
        let table = Arc::new(FakeTable::with(&[
            (600, serve.as_str()),
            (601, runner.as_str()),
            (602, "/usr/bin/vim"),
        ]));
        let orphans = resolver(table, 1).find_orphans(Some(600));
        let pids: Vec<u32> = orphans.iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![601]);
    }
}
