use std::ffi::OsString;
use std::path::{Path, PathBuf};

use log::{debug, info};
use modup_platform::background_command;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

const ARCHIVE_PLACEHOLDER: &str = "{archive}";
const DEST_PLACEHOLDER: &str = "{dest}";

/// External archiver invocation. `{archive}` and `{dest}` in the argument
/// lists are replaced with the staged archive and the module directory.
///
/// The listing must print one line per entry; the extraction prints one line
/// per extracted entry, which drives install progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveTool {
    pub program: String,
    pub list_args: Vec<String>,
    pub extract_args: Vec<String>,
}

impl ArchiveTool {
    #[must_use]
    pub fn unzip() -> Self {
        Self {
            program: "unzip".to_string(),
            list_args: vec!["-Z1".to_string(), ARCHIVE_PLACEHOLDER.to_string()],
            extract_args: vec![
                "-o".to_string(),
                ARCHIVE_PLACEHOLDER.to_string(),
                "-d".to_string(),
                DEST_PLACEHOLDER.to_string(),
            ],
        }
    }

    #[must_use]
    pub fn seven_zip() -> Self {
        Self {
            program: "7z".to_string(),
            list_args: vec![
                "l".to_string(),
                "-ba".to_string(),
                ARCHIVE_PLACEHOLDER.to_string(),
            ],
            extract_args: vec![
                "x".to_string(),
                "-y".to_string(),
                "-bb1".to_string(),
                format!("-o{DEST_PLACEHOLDER}"),
                ARCHIVE_PLACEHOLDER.to_string(),
            ],
        }
    }

    #[must_use]
    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            Self::seven_zip()
        } else {
            Self::unzip()
        }
    }

    /// Resolve the program on `PATH` (or as given, if it is a path).
    ///
    /// # Errors
    /// Returns [`InstallError::MissingTool`] when the program cannot be found.
    pub fn locate(&self) -> Result<PathBuf, InstallError> {
        which::which(&self.program).map_err(|_| InstallError::MissingTool {
            program: self.program.clone(),
        })
    }

    fn expand(args: &[String], archive: &Path, dest: &Path) -> Vec<OsString> {
        args.iter()
            .map(|arg| match arg.as_str() {
                ARCHIVE_PLACEHOLDER => archive.as_os_str().to_owned(),
                DEST_PLACEHOLDER => dest.as_os_str().to_owned(),
                other => OsString::from(
                    other
                        .replace(ARCHIVE_PLACEHOLDER, &archive.to_string_lossy())
                        .replace(DEST_PLACEHOLDER, &dest.to_string_lossy()),
                ),
            })
            .collect()
    }
}

impl Default for ArchiveTool {
    fn default() -> Self {
        Self::platform_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallProgress {
    pub current: u64,
    /// Entry count from the listing; 0 when it could not be determined.
    pub total: u64,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("archive tool `{program}` is not installed")]
    MissingTool { program: String },
    #[error("archive tool failed on {} ({status}): {stderr}", .archive.display())]
    Extraction {
        archive: PathBuf,
        status: String,
        stderr: String,
    },
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl InstallError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    /// A missing archive tool means no module can ever be installed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingTool { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Installer {
    tool: ArchiveTool,
    base_dir: PathBuf,
}

impl Installer {
    #[must_use]
    pub fn new(tool: ArchiveTool, base_dir: PathBuf) -> Self {
        Self { tool, base_dir }
    }

    /// Extract `archive` into `<base_dir>/<name>`, reporting one progress
    /// update per line the archiver prints.
    ///
    /// # Errors
    /// Returns [`InstallError::MissingTool`] if the archiver is absent,
    /// [`InstallError::Extraction`] if it exits unsuccessfully, or an I/O
    /// error if the module directory cannot be created.
    pub async fn install<F>(
        &self,
        name: &str,
        version: u64,
        archive: &Path,
        mut on_progress: F,
    ) -> Result<PathBuf, InstallError>
    where
        F: FnMut(InstallProgress),
    {
        let program = self.tool.locate()?;
        let dest = self.base_dir.join(name);
        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|error| InstallError::io("failed to create module directory", &dest, error))?;

        let total = self.count_entries(&program, archive).await;
        info!(
            "Installing {name}@{version} into {} ({total} entries)",
            dest.display()
        );

        let mut command = background_command(&program);
        command.args(ArchiveTool::expand(&self.tool.extract_args, archive, &dest));
        let mut child = command.spawn().map_err(|error| self.spawn_error(error))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let read_progress = async {
            let mut current: u64 = 0;
            let Some(stdout) = stdout else {
                return current;
            };
            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) if line.trim_ascii().is_empty() => {}
                    Ok(_) => {
                        current += 1;
                        on_progress(InstallProgress { current, total });
                    }
                    Err(error) => {
                        debug!("Stopped reading archive tool output: {error}");
                        // Closing stdout early kills the tool with SIGPIPE.
                        let drained = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                        if let Err(error) = drained {
                            debug!("Could not drain archive tool output: {error}");
                        }
                        break;
                    }
                }
            }
            current
        };
        let read_errors = async {
            let mut buffer = Vec::new();
            if let Some(mut stderr) = stderr
                && let Err(error) = stderr.read_to_end(&mut buffer).await
            {
                debug!("Could not read archive tool errors: {error}");
            }
            String::from_utf8_lossy(&buffer).into_owned()
        };
        let (extracted, error_output) = tokio::join!(read_progress, read_errors);

        let status = child
            .wait()
            .await
            .map_err(|error| InstallError::io("failed to wait for archive tool", archive, error))?;

        if !status.success() {
            return Err(InstallError::Extraction {
                archive: archive.to_path_buf(),
                status: status.to_string(),
                stderr: error_output.trim().to_string(),
            });
        }

        debug!("Extracted {extracted} entries for {name}@{version}");
        Ok(dest)
    }

    async fn count_entries(&self, program: &Path, archive: &Path) -> u64 {
        let mut command = background_command(program);
        command.args(ArchiveTool::expand(
            &self.tool.list_args,
            archive,
            &self.base_dir,
        ));

        match command.output().await {
            Ok(output) if output.status.success() => {
                parse_entry_count(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                debug!(
                    "Listing {} failed ({}), progress total unknown",
                    archive.display(),
                    output.status
                );
                0
            }
            Err(error) => {
                debug!("Could not list {}: {error}", archive.display());
                0
            }
        }
    }

    fn spawn_error(&self, error: std::io::Error) -> InstallError {
        if error.kind() == std::io::ErrorKind::NotFound {
            InstallError::MissingTool {
                program: self.tool.program.clone(),
            }
        } else {
            InstallError::io(
                "failed to start archive tool",
                Path::new(&self.tool.program),
                error,
            )
        }
    }
}

fn parse_entry_count(listing: &str) -> u64 {
    listing
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count() as u64
}
