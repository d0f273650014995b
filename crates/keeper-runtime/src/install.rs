//! Runtime binary acquisition.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::InstallError;
use crate::paths::{binary_name, ArchiveKind, InstallLayout, ReleaseArtifact};

/// Detects and installs the runtime binary.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Whether an executable runtime binary exists at the install path.
    fn is_installed(&self) -> bool;

    /// Download, extract and place the runtime binary.
    async fn install(&self) -> Result<(), InstallError>;
}

/// Installs the runtime from its GitHub release archive.
pub struct InstallationManager {
    layout: InstallLayout,
    artifact: Option<ReleaseArtifact>,
    archive_sha256: Option<String>,
    client: reqwest::Client,
}

impl InstallationManager {
    /// Create a manager for the configured layout and the host platform.
    pub fn new(config: &RuntimeConfig, layout: InstallLayout) -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.download_connect_timeout)
            .timeout(config.download_timeout)
            .build()
            .map_err(|e| InstallError::DownloadFailed(e.to_string()))?;

        // Unsupported platforms are reported by `install`, not here, so the
        // rest of the supervisor still works against an external instance.
        let artifact = match (&config.archive_url, ReleaseArtifact::current()) {
            (Some(url), _) => Some(ReleaseArtifact {
                kind: kind_from_url(url),
                url: url.clone(),
            }),
            (None, Ok(artifact)) => Some(artifact),
            (None, Err(e)) => {
                debug!("No release artifact for this host: {}", e);
                None
            }
        };

        Ok(Self {
            layout,
            artifact,
            archive_sha256: config.archive_sha256.clone(),
            client,
        })
    }

    /// The install layout.
    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    /// The artifact that `install` would download, if any.
    pub fn artifact(&self) -> Option<&ReleaseArtifact> {
        self.artifact.as_ref()
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), InstallError> {
        info!("Downloading runtime from {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| InstallError::DownloadFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(InstallError::DownloadFailed(format!(
                "HTTP {}: {}",
                response.status(),
                url
            )));
        }

        let mut file = File::create(dest)?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| InstallError::DownloadFailed(e.to_string()))?;
            file.write_all(&chunk)?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;
        }
        file.flush()?;
        debug!("Downloaded {} bytes to {:?}", downloaded, dest);

        if let Some(expected) = &self.archive_sha256 {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(InstallError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
            debug!("Checksum verified: {}", actual);
        }

        Ok(())
    }

    async fn install_in(&self, artifact: &ReleaseArtifact, work: &Path) -> Result<(), InstallError> {
        let archive = work.join(match artifact.kind {
            ArchiveKind::Zip => "runtime.zip",
            ArchiveKind::TarGz => "runtime.tgz",
        });
        self.download(&artifact.url, &archive).await?;

        let extract_dir = work.join("extracted");
        let kind = artifact.kind;
        let target = self.layout.binary_path().to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<(), InstallError> {
            fs::create_dir_all(&extract_dir)?;
            match kind {
                ArchiveKind::Zip => extract_zip(&archive, &extract_dir)?,
                ArchiveKind::TarGz => extract_tar_gz(&archive, &extract_dir)?,
            }

            let found = find_executable(&extract_dir, binary_name()).ok_or_else(|| {
                InstallError::ArchiveCorrupt(format!("no '{}' inside archive", binary_name()))
            })?;
            debug!("Found runtime executable at {:?}", found);

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&found, &target)?;
            set_executable(&target)?;
            Ok(())
        })
        .await
        .map_err(|e| InstallError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?
    }
}

#[async_trait]
impl Installer for InstallationManager {
    fn is_installed(&self) -> bool {
        is_executable(self.layout.binary_path())
    }

    async fn install(&self) -> Result<(), InstallError> {
        let artifact = match &self.artifact {
            Some(artifact) => artifact.clone(),
            None => ReleaseArtifact::current()?,
        };

        let work = tempfile::Builder::new()
            .prefix("ollama_installer")
            .tempdir()?;

        let result = self.install_in(&artifact, work.path()).await;

        // The work dir goes regardless of outcome.
        let work_path = work.path().to_path_buf();
        if let Err(e) = work.close() {
            warn!("Failed to remove temporary directory {:?}: {}", work_path, e);
        }

        match &result {
            Ok(()) => info!("Runtime installed at {:?}", self.layout.binary_path()),
            Err(e) => warn!("Runtime install failed: {}", e),
        }
        result
    }
}

fn kind_from_url(url: &str) -> ArchiveKind {
    if url.to_ascii_lowercase().ends_with(".zip") {
        ArchiveKind::Zip
    } else {
        ArchiveKind::TarGz
    }
}

/// Archive entry paths must stay inside the extraction directory.
fn safe_relative(name: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let file = File::open(archive)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);

    let entries = tar
        .entries()
        .map_err(|e| InstallError::ArchiveCorrupt(e.to_string()))?;

    fs::create_dir_all(dest)?;
    for entry in entries {
        let mut entry = entry.map_err(|e| InstallError::ArchiveCorrupt(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| InstallError::ArchiveCorrupt(e.to_string()))?
            .into_owned();

        if safe_relative(&path).is_none() {
            warn!("Skipping unsafe archive entry {:?}", path);
            continue;
        }

        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            let target = entry
                .link_name()
                .map_err(|e| InstallError::ArchiveCorrupt(e.to_string()))?;
            if target.map_or(true, |t| safe_relative(&t).is_none()) {
                warn!("Skipping archive link {:?} pointing outside the install", path);
                continue;
            }
        }

        // Refuses any entry whose resolved parent lands outside `dest`.
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| InstallError::ArchiveCorrupt(e.to_string()))?;
        if !unpacked {
            warn!("Skipping unsafe archive entry {:?}", path);
        }
    }
    Ok(())
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let file = File::open(archive)?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| InstallError::ArchiveCorrupt(e.to_string()))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| InstallError::ArchiveCorrupt(e.to_string()))?;
        let name = entry.name().replace('\\', "/");

        let Some(relative) = safe_relative(Path::new(&name)) else {
            warn!("Skipping unsafe archive entry {}", name);
            continue;
        };

        let out_path = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)?;
            io::copy(&mut entry, &mut out)?;
        }
    }
    Ok(())
}

/// Breadth-first search for a file named `name`; the shallowest match wins.
fn find_executable(root: &Path, name: &str) -> Option<PathBuf> {
    let mut queue = vec![root.to_path_buf()];

    while !queue.is_empty() {
        let mut next = Vec::new();
        for dir in queue {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
            entries.sort_by_key(|e| e.file_name());

            for entry in entries {
                let path = entry.path();
                // Symlinked directories are not followed, so loops terminate.
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if is_dir {
                    next.push(path);
                } else if entry.file_name() == name {
                    return Some(path);
                }
            }
        }
        queue = next;
    }
    None
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
