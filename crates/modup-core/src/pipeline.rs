//! Check cycle orchestration: compare, download, install, commit, notify.
//!
//! Every outdated module runs in its own task. The manifest, the progress
//! counters and the per-module states live behind one `std::sync::Mutex`, and
//! each increment together with the drained check that follows it happens in
//! a single critical section. Manifest writes are additionally serialized so
//! that the file on disk always reflects the latest in-memory snapshot.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::{debug, error, info, warn};
use modup_platform::{ModulePaths, Platform};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use crate::catalog::{CatalogQuery, RemoteCatalog, RemoteVersions, is_valid_module_name};
use crate::config::UpdaterConfig;
use crate::download::{DownloadError, DownloadManager, StagedArchive};
use crate::error::UpdaterError;
use crate::events::{EventBus, UpdateEvent};
use crate::host::{FeedHostUpdater, HostUpdateStatus, HostUpdater};
use crate::http::{build_client, url_with_query};
use crate::install::Installer;
use crate::locator::ModuleLocator;
use crate::manifest::{Manifest, ManifestError, ManifestStore};
use crate::progress::ProgressTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    UpToDate,
    DownloadQueued,
    Downloading,
    /// The download failed; an install is still attempted.
    DownloadFailed,
    Installing,
    /// Install failed and the attempted version was not recorded.
    InstallFailed,
    Committed,
}

impl ModuleState {
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::DownloadQueued | Self::Downloading | Self::DownloadFailed | Self::Installing
        )
    }
}

/// Receives errors after which the updater cannot do anything useful.
pub trait FatalErrorHandler: Send + Sync {
    fn on_fatal(&self, error: &UpdaterError);
}

/// Logs the error and terminates the process with status 1.
pub struct ExitOnFatal;

impl FatalErrorHandler for ExitOnFatal {
    fn on_fatal(&self, error: &UpdaterError) {
        error!("Fatal updater error: {error}");
        std::process::exit(1);
    }
}

pub struct PipelineBuilder {
    config: UpdaterConfig,
    paths: ModulePaths,
    platform: Platform,
    client: Option<reqwest::Client>,
    host_updater: Option<Arc<dyn HostUpdater>>,
    events: Option<Arc<EventBus>>,
    locator: Option<Arc<ModuleLocator>>,
    fatal: Option<Arc<dyn FatalErrorHandler>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub fn with_host_updater(mut self, host_updater: Arc<dyn HostUpdater>) -> Self {
        self.host_updater = Some(host_updater);
        self
    }

    #[must_use]
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn with_locator(mut self, locator: Arc<ModuleLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    #[must_use]
    pub fn with_fatal_handler(mut self, fatal: Arc<dyn FatalErrorHandler>) -> Self {
        self.fatal = Some(fatal);
        self
    }

    /// Prepare the install tree and load the manifest.
    ///
    /// In remote mode the staging directory is wiped and recreated, and an
    /// unreadable manifest is replaced by core entries at version 0 (the
    /// pipeline is then bootstrapping). In local mode nothing on disk is
    /// touched.
    ///
    /// # Errors
    /// Returns an error if the config is invalid, the HTTP client cannot be
    /// built, or the install or staging directories cannot be prepared.
    pub fn initialize(self) -> Result<UpdatePipeline, UpdaterError> {
        let Self {
            config,
            paths,
            platform,
            client,
            host_updater,
            events,
            locator,
            fatal,
        } = self;

        config.validate()?;

        let client = match client {
            Some(client) => client,
            None => build_client(config.http_timeout())?,
        };
        let query = CatalogQuery::new(config.host_version.clone(), platform);
        let catalog = RemoteCatalog::new(
            client.clone(),
            &config.endpoint,
            config.release_channel.clone(),
            config.max_redirects,
        );
        let downloads =
            DownloadManager::new(client.clone(), paths.staging_dir.clone(), config.max_redirects);
        let installer = Installer::new(config.archive_tool.clone(), paths.install_dir.clone());
        let manifest_store =
            ManifestStore::new(paths.manifest_file.clone(), config.core_modules.clone());
        let host = host_updater.unwrap_or_else(|| {
            Arc::new(FeedHostUpdater::new(
                client,
                config.host_version.clone(),
                platform,
                config.max_redirects,
            ))
        });
        let locator = locator.unwrap_or_default();

        info!(
            "Distribution: {}",
            if config.is_local_distribution() {
                "local"
            } else {
                "remote"
            }
        );
        info!(
            "Host updates: {}",
            if config.skip_host_update {
                "disabled"
            } else {
                "enabled"
            }
        );
        info!(
            "Module updates: {}",
            if config.module_updates_disabled() {
                "disabled"
            } else {
                "enabled"
            }
        );

        let (manifest, bootstrapping) = if let Some(root) = &config.local_modules_root {
            locator.add_root(root.clone());
            (Manifest::default(), false)
        } else {
            std::fs::create_dir_all(&paths.install_dir).map_err(|error| {
                UpdaterError::io(
                    "failed to create module install directory",
                    &paths.install_dir,
                    error,
                )
            })?;
            locator.add_root(paths.install_dir.clone());
            downloads.reset_staging()?;

            info!("Module install path: {}", paths.install_dir.display());
            info!("Module manifest: {}", paths.manifest_file.display());
            info!("Module download path: {}", paths.staging_dir.display());

            let loaded = manifest_store.load_reporting();
            (loaded.manifest, loaded.seeded)
        };

        if !config.skip_host_update {
            host.set_feed_url(host_feed_url(&config, platform)?);
        }

        let limit = config
            .max_concurrent_modules
            .map(|permits| Arc::new(Semaphore::new(permits)));

        Ok(UpdatePipeline {
            inner: Arc::new(Inner {
                query,
                catalog,
                downloads,
                installer,
                manifest_store,
                host,
                events: events.unwrap_or_default(),
                locator,
                fatal: fatal.unwrap_or_else(|| Arc::new(ExitOnFatal)),
                state: Mutex::new(SharedState {
                    manifest,
                    tracker: ProgressTracker::default(),
                    modules: HashMap::new(),
                }),
                commit_order: Mutex::new(()),
                check_gate: tokio::sync::Mutex::new(None),
                tasks: TaskTracker::new(),
                limit,
                bootstrapping,
                config,
            }),
        })
    }
}

fn host_feed_url(config: &UpdaterConfig, platform: Platform) -> Result<String, UpdaterError> {
    let url = url_with_query(
        &format!(
            "{}/updates/{}",
            config.endpoint.trim_end_matches('/'),
            config.release_channel
        ),
        &[
            ("platform", platform.as_str()),
            ("version", config.host_version.as_str()),
        ],
    )?;
    Ok(url.to_string())
}

struct SharedState {
    manifest: Manifest,
    tracker: ProgressTracker,
    modules: HashMap<String, ModuleState>,
}

struct Inner {
    config: UpdaterConfig,
    query: CatalogQuery,
    catalog: RemoteCatalog,
    downloads: DownloadManager,
    installer: Installer,
    manifest_store: ManifestStore,
    host: Arc<dyn HostUpdater>,
    events: Arc<EventBus>,
    locator: Arc<ModuleLocator>,
    fatal: Arc<dyn FatalErrorHandler>,
    state: Mutex<SharedState>,
    commit_order: Mutex<()>,
    /// Completion time of the last check cycle.
    check_gate: tokio::sync::Mutex<Option<Instant>>,
    tasks: TaskTracker,
    limit: Option<Arc<Semaphore>>,
    bootstrapping: bool,
}

#[derive(Clone)]
pub struct UpdatePipeline {
    inner: Arc<Inner>,
}

impl UpdatePipeline {
    #[must_use]
    pub fn builder(config: UpdaterConfig, paths: ModulePaths) -> PipelineBuilder {
        PipelineBuilder {
            config,
            paths,
            platform: Platform::current(),
            client: None,
            host_updater: None,
            events: None,
            locator: None,
            fatal: None,
        }
    }

    /// Run one check cycle unless the previous one finished within the
    /// cooldown, in which case only `checked` (without a count) is emitted.
    ///
    /// Per-module work continues in the background after this returns; use
    /// [`UpdatePipeline::wait_idle`] to wait for it.
    pub async fn check_for_updates(&self) {
        self.inner.check(false).await;
    }

    /// Add `name` to the manifest at version 0 and, unless `defer` is set,
    /// run a check cycle right away.
    ///
    /// # Errors
    /// Returns an error if `name` is not a plain module name or the manifest
    /// cannot be written.
    pub async fn request_install(&self, name: &str, defer: bool) -> Result<(), UpdaterError> {
        if !is_valid_module_name(name) {
            return Err(UpdaterError::InvalidModuleName {
                name: name.to_string(),
            });
        }
        if self.inner.config.is_local_distribution() {
            debug!("Ignoring install request for {name}: modules are distributed locally");
            return Ok(());
        }
        if self.inner.register_module(name)? {
            info!("Registered module {name} for installation");
        }
        if !defer {
            self.inner.check(true).await;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error if no host update is ready or it cannot be launched.
    pub fn quit_and_install_updates(&self) -> Result<(), UpdaterError> {
        self.inner.host.quit_and_install().map_err(UpdaterError::from)
    }

    /// Resolve once every queued module has been installed or has failed.
    pub async fn wait_idle(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// The manifest had to be seeded during initialization.
    #[must_use]
    pub fn is_bootstrapping(&self) -> bool {
        self.inner.bootstrapping
    }

    #[must_use]
    pub fn installed_modules(&self) -> BTreeMap<String, u64> {
        self.inner.lock_state().manifest.versions()
    }

    #[must_use]
    pub fn is_installed(&self, name: &str) -> bool {
        if self.inner.config.is_local_distribution() {
            return self.inner.locator.resolve(name).is_some();
        }
        self.inner.lock_state().manifest.version_or_zero(name) > 0
    }

    #[must_use]
    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.inner.lock_state().modules.get(name).copied()
    }

    #[must_use]
    pub fn progress(&self) -> ProgressTracker {
        self.inner.lock_state().tracker
    }

    #[must_use]
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.events)
    }

    #[must_use]
    pub fn locator(&self) -> Arc<ModuleLocator> {
        Arc::clone(&self.inner.locator)
    }

    #[must_use]
    pub fn config(&self) -> &UpdaterConfig {
        &self.inner.config
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, name: &str, state: ModuleState) {
        self.lock_state().modules.insert(name.to_string(), state);
    }

    async fn check(self: &Arc<Self>, force: bool) {
        let mut gate = self.check_gate.lock().await;
        if !force
            && let Some(finished) = *gate
            && finished.elapsed() < self.config.check_cooldown()
        {
            debug!("Update check skipped, last one finished {:?} ago", finished.elapsed());
            self.events.emit(UpdateEvent::Checked {
                count: None,
                failed: false,
            });
            return;
        }

        info!("Checking for updates");
        let ((), modules) = tokio::join!(self.check_host(), self.check_modules());
        *gate = Some(Instant::now());
        drop(gate);

        match modules {
            Ok(count) => {
                info!("Update check queued {count} module downloads");
                self.events.emit(UpdateEvent::Checked {
                    count: Some(count),
                    failed: false,
                });
            }
            Err(error) => {
                warn!("Module update check failed: {error}");
                self.events.emit(UpdateEvent::UpdateError {
                    error: error.to_string(),
                });
                self.events.emit(UpdateEvent::Checked {
                    count: None,
                    failed: true,
                });
            }
        }
    }

    async fn check_host(&self) {
        if self.config.skip_host_update {
            return;
        }
        match self.host.check().await {
            Ok(HostUpdateStatus::UpToDate) => debug!("Host is up to date"),
            Ok(HostUpdateStatus::Ready { version }) => {
                info!("Host update {version} downloaded");
                self.events.emit(UpdateEvent::HostUpdated);
            }
            Ok(HostUpdateStatus::Manual(payload)) => {
                self.events.emit(UpdateEvent::Manual { payload });
            }
            Err(error) => {
                warn!("Host update check failed: {error}");
                self.events.emit(UpdateEvent::UpdateError {
                    error: UpdaterError::from(error).to_string(),
                });
            }
        }
    }

    async fn check_modules(self: &Arc<Self>) -> Result<usize, UpdaterError> {
        if self.config.module_updates_disabled() {
            return Ok(0);
        }

        let mut remote = self.catalog.fetch_versions(&self.query).await?;
        remote.retain(|name, _| {
            if is_valid_module_name(name) {
                return true;
            }
            let error = UpdaterError::InvalidModuleName { name: name.clone() };
            warn!("Skipping catalog entry: {error}");
            self.events.emit(UpdateEvent::UpdateError {
                error: error.to_string(),
            });
            false
        });
        let queued = self.queue_outdated(&remote);
        for (name, version) in &queued {
            let inner = Arc::clone(self);
            self.tasks.spawn(inner.update_module(name.clone(), *version));
        }
        Ok(queued.len())
    }

    fn queue_outdated(&self, remote: &RemoteVersions) -> Vec<(String, u64)> {
        let mut state = self.lock_state();
        let mut queued = Vec::new();

        for (name, &version) in remote {
            let current = state.modules.get(name).copied();
            if current.is_some_and(ModuleState::is_in_flight) {
                debug!("{name} is already being updated");
                continue;
            }
            let installed = state.manifest.version_or_zero(name);
            if installed == version {
                state.modules.insert(name.clone(), ModuleState::UpToDate);
                continue;
            }
            debug!("{name}: installed {installed}, remote {version}");
            state
                .modules
                .insert(name.clone(), ModuleState::DownloadQueued);
            state.tracker.queue_download();
            queued.push((name.clone(), version));
        }

        queued
    }

    async fn update_module(self: Arc<Self>, name: String, version: u64) {
        let _permit = match &self.limit {
            Some(limit) => Arc::clone(limit).acquire_owned().await.ok(),
            None => None,
        };

        self.set_state(&name, ModuleState::Downloading);
        let mut received_bytes = 0;
        let downloaded = self
            .download_module(&name, version, &mut received_bytes)
            .await;
        let download_ok = downloaded.is_ok();
        let archive = downloaded.unwrap_or_else(|error| {
            warn!("Download of {name}@{version} failed: {error}");
            self.downloads.staged(&name, version)
        });

        let downloads_drained = {
            let mut state = self.lock_state();
            state.modules.insert(
                name.clone(),
                if download_ok {
                    ModuleState::Installing
                } else {
                    ModuleState::DownloadFailed
                },
            );
            state.tracker.download_finished(download_ok)
        };
        self.events.emit(UpdateEvent::DownloadedModule {
            name: name.clone(),
            succeeded: download_ok,
            received_bytes,
        });
        if let Some(failed) = downloads_drained {
            self.events.emit(UpdateEvent::Downloaded { failed });
        }

        let (install_ok, committed) = self.install_module(&name, version, &archive).await;

        let installs_drained = {
            let mut state = self.lock_state();
            state.modules.insert(
                name.clone(),
                if committed {
                    ModuleState::Committed
                } else {
                    ModuleState::InstallFailed
                },
            );
            state.tracker.install_finished(install_ok)
        };
        self.events.emit(UpdateEvent::InstalledModule {
            name: name.clone(),
            succeeded: install_ok,
        });
        remove_archive(&archive.path);
        if let Some(failed) = installs_drained {
            info!("Module updates finished, {failed} failed");
            self.events.emit(UpdateEvent::Installed { failed });
        }
    }

    async fn download_module(
        &self,
        name: &str,
        version: u64,
        received_bytes: &mut u64,
    ) -> Result<StagedArchive, DownloadError> {
        let url = self.catalog.module_url(name, version, &self.query)?;
        self.downloads
            .download(name, version, url, |progress| {
                *received_bytes = progress.received;
                self.events.emit(UpdateEvent::DownloadingModule {
                    name: name.to_string(),
                    cur: progress.received,
                    total: progress.total,
                });
            })
            .await
    }

    /// Returns whether extraction succeeded and whether the version was
    /// recorded in the manifest.
    async fn install_module(
        &self,
        name: &str,
        version: u64,
        archive: &StagedArchive,
    ) -> (bool, bool) {
        let result = self
            .installer
            .install(name, version, &archive.path, |progress| {
                self.events.emit(UpdateEvent::InstallingModule {
                    name: name.to_string(),
                    cur: progress.current,
                    total: progress.total,
                });
            })
            .await;

        let (install_ok, commit) = match result {
            Ok(dest) => {
                debug!("Installed {name}@{version} into {}", dest.display());
                (true, true)
            }
            Err(error) if error.is_fatal() => {
                let error = UpdaterError::from(error);
                error!("Cannot install {name}@{version}: {error}");
                self.events.emit(UpdateEvent::UpdateError {
                    error: error.to_string(),
                });
                self.fatal.on_fatal(&error);
                (false, false)
            }
            Err(error) => {
                warn!("Install of {name}@{version} failed: {error}");
                (false, self.config.commit_failed_installs)
            }
        };

        if !commit {
            return (install_ok, false);
        }
        match self.commit_version(name, version) {
            Ok(()) => (install_ok, true),
            Err(error) => {
                error!("Failed to record {name}@{version}: {error}");
                self.events.emit(UpdateEvent::UpdateError {
                    error: UpdaterError::from(error).to_string(),
                });
                (install_ok, true)
            }
        }
    }

    fn commit_version(&self, name: &str, version: u64) -> Result<(), ManifestError> {
        let _order = self
            .commit_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let snapshot = {
            let mut state = self.lock_state();
            state.manifest.set_installed(name, version);
            state.manifest.clone()
        };
        self.manifest_store.commit(&snapshot)
    }

    fn register_module(&self, name: &str) -> Result<bool, ManifestError> {
        let _order = self
            .commit_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let snapshot = {
            let mut state = self.lock_state();
            if !state.manifest.ensure(name) {
                return Ok(false);
            }
            state.manifest.clone()
        };
        self.manifest_store.commit(&snapshot)?;
        Ok(true)
    }
}

fn remove_archive(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed staged archive {}", path.display()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!("Failed to remove staged archive {}: {error}", path.display()),
    }
}
