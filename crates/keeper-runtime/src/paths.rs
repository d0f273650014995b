//! Install locations and release artifacts for the runtime binary.

use std::path::{Path, PathBuf};

use crate::error::InstallError;

/// Base URL of the runtime's "latest" GitHub release.
pub const RELEASE_BASE_URL: &str = "https://github.com/ollama/ollama/releases/latest/download";

/// Archive format of a release artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// `.zip`, used on Windows.
    Zip,
    /// `.tgz` (tar + gzip), used everywhere else.
    TarGz,
}

/// A downloadable release artifact for one OS/arch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseArtifact {
    pub url: String,
    pub kind: ArchiveKind,
}

impl ReleaseArtifact {
    /// Select the artifact for the given OS and architecture
    /// (values as in `std::env::consts`).
    pub fn for_platform(os: &str, arch: &str) -> Result<Self, InstallError> {
        let (file, kind) = match (os, arch) {
            ("linux", "x86_64") => ("ollama-linux-amd64.tgz", ArchiveKind::TarGz),
            ("linux", "aarch64") => ("ollama-linux-arm64.tgz", ArchiveKind::TarGz),
            ("macos", "x86_64") | ("macos", "aarch64") => ("ollama-darwin.tgz", ArchiveKind::TarGz),
            ("windows", "x86_64") => ("ollama-windows-amd64.zip", ArchiveKind::Zip),
            ("windows", "aarch64") => ("ollama-windows-arm64.zip", ArchiveKind::Zip),
            _ => {
                return Err(InstallError::UnsupportedPlatform {
                    os: os.to_string(),
                    arch: arch.to_string(),
                })
            }
        };

        Ok(Self {
            url: format!("{}/{}", RELEASE_BASE_URL, file),
            kind,
        })
    }

    /// Select the artifact for the running host.
    pub fn current() -> Result<Self, InstallError> {
        Self::for_platform(std::env::consts::OS, std::env::consts::ARCH)
    }
}

/// File name of the runtime executable on this platform.
pub fn binary_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "ollama.exe"
    } else {
        "ollama"
    }
}

/// Where the runtime binary lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    binary_path: PathBuf,
}

impl InstallLayout {
    /// Use an explicit binary path.
    pub fn at(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// The fixed per-OS install path:
    /// `~/.ollama/bin/ollama` on Unix-likes,
    /// `%LOCALAPPDATA%\Ollama\ollama.exe` on Windows.
    pub fn detect() -> Result<Self, InstallError> {
        let path = if cfg!(target_os = "windows") {
            dirs::data_local_dir()
                .ok_or_else(|| InstallError::NoInstallLocation("LocalAppData not set".into()))?
                .join("Ollama")
                .join(binary_name())
        } else {
            dirs::home_dir()
                .ok_or_else(|| InstallError::NoInstallLocation("home directory unknown".into()))?
                .join(".ollama")
                .join("bin")
                .join(binary_name())
        };
        Ok(Self::at(path))
    }

    /// Path to the runtime executable.
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Directory containing the executable.
    pub fn bin_dir(&self) -> Option<&Path> {
        self.binary_path.parent()
    }
}
