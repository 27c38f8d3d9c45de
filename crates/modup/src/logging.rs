use std::fs::OpenOptions;
use std::io;
use std::path::Path;

#[cfg(debug_assertions)]
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};

/// Install the updater's loggers: an appending file logger for the
/// `updater.log` under the cache directory, plus the terminal in debug builds.
/// Only records from `modup*` targets are kept.
pub fn init_logging(log_path: &Path, debug_enabled: bool, max_log_size: u64) {
    let prepared = prepare_log_file(log_path, max_log_size);

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("modup")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    #[cfg(debug_assertions)]
    loggers.push(TermLogger::new(
        LevelFilter::Debug,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));

    let file = OpenOptions::new().create(true).append(true).open(log_path);
    let file_error = match file {
        Ok(file) => {
            loggers.push(WriteLogger::new(LevelFilter::Debug, config, file));
            None
        }
        Err(error) => Some(error),
    };

    if !loggers.is_empty() && CombinedLogger::init(loggers).is_err() {
        return;
    }
    log::set_max_level(max_level(debug_enabled));

    if let Some(error) = file_error {
        log::warn!("Cannot write {}: {error}", log_path.display());
    }
    if let Err(error) = prepared {
        log::warn!("Could not trim {}: {error}", log_path.display());
    }
    log::info!("Logging to {}", log_path.display());
}

/// Debug records are opt-in through the `debug_logging` setting.
fn max_level(debug_enabled: bool) -> LevelFilter {
    if debug_enabled {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

fn prepare_log_file(log_path: &Path, max_log_size: u64) -> io::Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = match std::fs::read(log_path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error),
    };
    match retained_tail(&contents, max_log_size) {
        Some(tail) => std::fs::write(log_path, tail),
        None => Ok(()),
    }
}

/// Once `contents` exceeds `max_size`, the newest `max_size / 2` bytes,
/// starting on a line boundary. `None` when no trim is needed.
fn retained_tail(contents: &[u8], max_size: u64) -> Option<&[u8]> {
    if u64::try_from(contents.len()).is_ok_and(|len| len <= max_size) {
        return None;
    }
    let keep = usize::try_from(max_size / 2)
        .map_or(contents.len(), |keep| keep.min(contents.len()));
    let cut = contents.len() - keep;
    if cut == 0 || contents[cut - 1] == b'\n' {
        return Some(&contents[cut..]);
    }
    let start = contents[cut..]
        .iter()
        .position(|&byte| byte == b'\n')
        .map_or(contents.len(), |offset| cut + offset + 1);
    Some(&contents[start..])
}
