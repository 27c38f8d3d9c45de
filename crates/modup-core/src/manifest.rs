//! Durable record of installed module versions (`installed.json`).
//!
//! The file is a JSON object keyed by module name:
//! `{ "voice": { "installedVersion": 12 } }`. A missing or unreadable file is
//! never an error; it yields a manifest seeded with every core module at
//! version 0, which means "not installed yet".

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub installed_version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    modules: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    #[must_use]
    pub fn seeded<I, S>(core_modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut manifest = Self::default();
        for name in core_modules {
            manifest.ensure(name);
        }
        manifest
    }

    #[must_use]
    pub fn installed_version(&self, name: &str) -> Option<u64> {
        self.modules.get(name).map(|entry| entry.installed_version)
    }

    /// Installed version, treating unknown modules as not installed.
    #[must_use]
    pub fn version_or_zero(&self, name: &str) -> u64 {
        self.installed_version(name).unwrap_or(0)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Add a zero entry for `name` if it is missing. Returns whether an entry
    /// was added.
    pub fn ensure(&mut self, name: impl Into<String>) -> bool {
        let mut added = false;
        self.modules.entry(name.into()).or_insert_with(|| {
            added = true;
            ManifestEntry::default()
        });
        added
    }

    pub fn set_installed(&mut self, name: impl Into<String>, version: u64) {
        self.modules.insert(
            name.into(),
            ManifestEntry {
                installed_version: version,
            },
        );
    }

    #[must_use]
    pub fn versions(&self) -> BTreeMap<String, u64> {
        self.modules
            .iter()
            .map(|(name, entry)| (name.clone(), entry.installed_version))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ManifestError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManifestLoad {
    pub manifest: Manifest,
    /// The file was missing or unreadable and the manifest was seeded.
    pub seeded: bool,
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
    core_modules: Vec<String>,
}

impl ManifestStore {
    #[must_use]
    pub fn new(path: PathBuf, core_modules: Vec<String>) -> Self {
        Self { path, core_modules }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn load(&self) -> Manifest {
        self.load_reporting().manifest
    }

    #[must_use]
    pub fn load_reporting(&self) -> ManifestLoad {
        let parsed = std::fs::read_to_string(&self.path)
            .map_err(|error| error.to_string())
            .and_then(|data| {
                serde_json::from_str::<Manifest>(&data).map_err(|error| error.to_string())
            });

        match parsed {
            Ok(mut manifest) => {
                for name in &self.core_modules {
                    if manifest.ensure(name.clone()) {
                        debug!("Core module {name} missing from manifest, added at version 0");
                    }
                }
                ManifestLoad {
                    manifest,
                    seeded: false,
                }
            }
            Err(error) => {
                warn!(
                    "Could not read module manifest {}: {error}; seeding core modules",
                    self.path.display()
                );
                ManifestLoad {
                    manifest: Manifest::seeded(self.core_modules.iter().cloned()),
                    seeded: true,
                }
            }
        }
    }

    /// Persist the manifest, replacing the previous file atomically.
    ///
    /// # Errors
    /// Returns an error if the manifest cannot be serialized or written.
    pub fn commit(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        let data = serde_json::to_vec_pretty(manifest)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                ManifestError::io("failed to create manifest directory", parent, error)
            })?;
        }
        replace_contents(&self.path, &data)
            .map_err(|error| ManifestError::io("failed to write manifest", &self.path, error))?;
        info!(
            "Committed manifest with {} modules to {}",
            manifest.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Write `data` to a temp file next to `path`, sync it, then rename it over
/// `path`. Readers see either the old manifest or the new one.
fn replace_contents(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::Builder::new()
        .prefix(".installed-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    staged.write_all(data)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|error| error.error)?;
    Ok(())
}
