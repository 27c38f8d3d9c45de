use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::SettingsError;
use crate::download::DownloadError;
use crate::host::HostUpdateError;
use crate::http::NetworkError;
use crate::install::InstallError;
use crate::manifest::ManifestError;

/// Any failure the pipeline reports. Its Display text is what an
/// `update-error` event carries.
#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    HostUpdate(#[from] HostUpdateError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("module name {name:?} is not a single path component")]
    InvalidModuleName { name: String },
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl UpdaterError {
    pub(crate) fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Install(error) if error.is_fatal())
    }
}
