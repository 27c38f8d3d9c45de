use std::path::{Path, PathBuf};
use thiserror::Error;

const APP_DIR: &str = "modup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("could not determine the user {0} directory")]
pub struct AppPathsError(&'static str);

/// Per-user locations of the updater. Settings live in the config directory,
/// the log in the cache directory, and the lock and module trees in the data
/// directory.
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// # Errors
    /// Returns an error when a user base directory cannot be determined.
    pub fn new() -> Result<Self, AppPathsError> {
        #[cfg(target_os = "macos")]
        let (config, cache, data) = {
            let library = dirs::home_dir()
                .ok_or(AppPathsError("home"))?
                .join("Library");
            let support = library.join("Application Support");
            (support.clone(), library.join("Caches"), support)
        };

        #[cfg(not(target_os = "macos"))]
        let (config, cache, data) = (
            dirs::config_dir().ok_or(AppPathsError("config"))?,
            dirs::cache_dir().ok_or(AppPathsError("cache"))?,
            dirs::data_dir().ok_or(AppPathsError("data"))?,
        );

        Ok(Self::under(&config, &cache, &data))
    }

    fn under(config: &Path, cache: &Path, data: &Path) -> Self {
        Self {
            config_dir: config.join(APP_DIR),
            cache_dir: cache.join(APP_DIR),
            data_dir: data.join(APP_DIR),
        }
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.cache_dir.join("updater.log")
    }

    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join("updater.lock")
    }

    /// Module layout for one host version. Modules live under the versioned
    /// data directory so that a host upgrade starts from a clean tree.
    #[must_use]
    pub fn module_paths(&self, host_version: &str) -> ModulePaths {
        ModulePaths::new(self.data_dir.join(host_version).join("modules"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulePaths {
    pub install_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub manifest_file: PathBuf,
}

impl ModulePaths {
    #[must_use]
    pub fn new(install_dir: PathBuf) -> Self {
        Self {
            staging_dir: install_dir.join("pending"),
            manifest_file: install_dir.join("installed.json"),
            install_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{AppPaths, AppPathsError, ModulePaths};

    fn test_paths(root: &Path) -> AppPaths {
        AppPaths::under(&root.join("config"), &root.join("cache"), &root.join("data"))
    }

    #[test]
    fn files_land_in_their_base_directories() {
        let paths = test_paths(Path::new("/tmp/modup-test"));

        assert_eq!(
            paths.settings_file(),
            Path::new("/tmp/modup-test/config/modup/settings.json")
        );
        assert_eq!(
            paths.log_file(),
            Path::new("/tmp/modup-test/cache/modup/updater.log")
        );
        assert_eq!(
            paths.lock_file(),
            Path::new("/tmp/modup-test/data/modup/updater.lock")
        );
    }

    #[test]
    fn module_paths_are_versioned_under_data_dir() {
        let paths = test_paths(Path::new("/tmp/modup-test"));
        let modules = paths.module_paths("1.0.9001");

        assert_eq!(
            modules.install_dir,
            Path::new("/tmp/modup-test/data/modup/1.0.9001/modules")
        );
        assert_eq!(modules.staging_dir, modules.install_dir.join("pending"));
        assert_eq!(
            modules.manifest_file,
            modules.install_dir.join("installed.json")
        );
    }

    #[test]
    fn module_paths_from_custom_root() {
        let modules = ModulePaths::new(Path::new("/opt/app/modules").to_path_buf());
        assert_eq!(modules.staging_dir, Path::new("/opt/app/modules/pending"));
    }

    #[test]
    fn missing_directory_is_named_in_error() {
        assert_eq!(
            AppPathsError("cache").to_string(),
            "could not determine the user cache directory"
        );
    }
}
