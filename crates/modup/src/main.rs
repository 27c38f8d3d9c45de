mod fatal;
mod lock;
mod logging;

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};
use modup_core::{JsonSettings, SettingsStore, UpdateEvent, UpdatePipeline, UpdaterConfig};
use modup_platform::AppPaths;

use crate::fatal::ForwardFatal;
use crate::lock::{LockError, UpdaterLock};

fn main() -> ExitCode {
    let paths = match AppPaths::new() {
        Ok(paths) => paths,
        Err(error) => {
            eprintln!("modup: {error}");
            return ExitCode::FAILURE;
        }
    };

    let mut settings = JsonSettings::load(paths.settings_file());
    let config = UpdaterConfig::from_settings(&settings);
    logging::init_logging(
        &paths.log_file(),
        config.debug_logging,
        config.max_log_size_bytes,
    );

    if !settings.path().exists() {
        let written = config
            .write_to(&mut settings)
            .and_then(|()| settings.save());
        match written {
            Ok(()) => info!("Wrote default settings to {}", settings.path().display()),
            Err(error) => warn!("Could not write default settings: {error}"),
        }
    }

    let _lock = match UpdaterLock::acquire(&paths.lock_file()) {
        Ok(lock) => lock,
        Err(LockError::AlreadyRunning) => {
            info!("Another updater is running, exiting");
            return ExitCode::SUCCESS;
        }
        Err(error) => {
            error!("{error}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            error!("Failed to start async runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&paths, config)) {
        Outcome::Finished(code) => code,
        Outcome::Fatal(message) => {
            runtime.shutdown_background();
            fatal::show_fatal_dialog(&message);
            ExitCode::from(1)
        }
    }
}

enum Outcome {
    Finished(ExitCode),
    /// A module can never be installed; the dialog is shown on the main thread.
    Fatal(String),
}

async fn run(paths: &AppPaths, config: UpdaterConfig) -> Outcome {
    let module_paths = paths.module_paths(&config.host_version);
    let (fatal_handler, mut fatal_errors) = ForwardFatal::channel();
    let pipeline = match UpdatePipeline::builder(config, module_paths)
        .with_fatal_handler(Arc::new(fatal_handler))
        .initialize()
    {
        Ok(pipeline) => pipeline,
        Err(error) => {
            error!("Failed to initialize updater: {error}");
            return Outcome::Finished(ExitCode::FAILURE);
        }
    };

    if pipeline.is_bootstrapping() {
        info!("No usable module manifest, installing core modules");
    }

    let events = pipeline.events();
    let subscription = events.subscribe(log_event);

    pipeline.check_for_updates().await;
    let fatal = tokio::select! {
        () = pipeline.wait_idle() => fatal_errors.try_recv().ok(),
        Some(message) = fatal_errors.recv() => Some(message),
    };
    events.unsubscribe(subscription);
    if let Some(message) = fatal {
        return Outcome::Fatal(message);
    }

    let history = events.query_and_truncate_history();
    let check_failed = history
        .iter()
        .any(|record| matches!(record.event, UpdateEvent::Checked { failed: true, .. }));
    let host_updated = history
        .iter()
        .any(|record| record.event == UpdateEvent::HostUpdated);

    if host_updated && let Err(error) = pipeline.quit_and_install_updates() {
        warn!("Host update could not be applied: {error}");
    }

    for (name, version) in pipeline.installed_modules() {
        info!("{name}: {version}");
    }

    Outcome::Finished(if check_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn log_event(event: &UpdateEvent) {
    match event {
        UpdateEvent::DownloadedModule {
            name,
            succeeded: false,
            ..
        } => warn!("Download of {name} failed"),
        UpdateEvent::InstalledModule {
            name,
            succeeded: false,
        } => warn!("Install of {name} failed"),
        UpdateEvent::InstalledModule {
            name,
            succeeded: true,
        } => info!("Installed {name}"),
        UpdateEvent::Installed { failed } => info!("Module updates done, {failed} failed"),
        UpdateEvent::Manual { payload } => info!(
            "Host {} is available at {} (running {})",
            payload.latest_version, payload.url, payload.current_version
        ),
        UpdateEvent::UpdateError { error } => warn!("Update error: {error}"),
        UpdateEvent::HostUpdated => info!("Host update ready"),
        _ => {}
    }
}
