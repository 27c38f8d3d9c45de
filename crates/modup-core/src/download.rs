use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use log::{debug, info};
use reqwest::Url;
use reqwest::header::CONTENT_LENGTH;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::http::{NetworkError, get_following_redirects};

/// Total reported when the server omits a usable `Content-Length`.
pub const UNKNOWN_TOTAL: u64 = 1;

/// An archive written to the staging directory, waiting for the installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArchive {
    pub name: String,
    pub version: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub received: u64,
    pub total: u64,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("download stream from {url} failed: {source}")]
    Stream {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Clone)]
pub struct DownloadManager {
    client: reqwest::Client,
    staging_dir: PathBuf,
    max_redirects: usize,
}

impl DownloadManager {
    #[must_use]
    pub fn new(client: reqwest::Client, staging_dir: PathBuf, max_redirects: usize) -> Self {
        Self {
            client,
            staging_dir,
            max_redirects,
        }
    }

    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Drop anything left in the staging directory by a previous run and
    /// recreate it empty. Partial downloads are never resumed.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be removed or created.
    pub fn reset_staging(&self) -> Result<(), DownloadError> {
        match std::fs::remove_dir_all(&self.staging_dir) {
            Ok(()) => debug!("Cleared staging directory {}", self.staging_dir.display()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(DownloadError::io(
                    "failed to clear staging directory",
                    &self.staging_dir,
                    error,
                ));
            }
        }
        std::fs::create_dir_all(&self.staging_dir).map_err(|error| {
            DownloadError::io(
                "failed to create staging directory",
                &self.staging_dir,
                error,
            )
        })
    }

    /// Where the archive for `name` at `version` is staged.
    #[must_use]
    pub fn staged(&self, name: &str, version: u64) -> StagedArchive {
        StagedArchive {
            name: name.to_string(),
            version,
            path: self.staging_dir.join(format!("{name}-{version}.zip")),
        }
    }

    /// Stream the archive at `url` into the staging directory, following
    /// redirects, reporting progress after every received chunk.
    ///
    /// The body of a non-2xx final response is staged as well, so the
    /// installer can still be attempted on it.
    ///
    /// # Errors
    /// Returns an error on transport failure, a non-2xx final response, or if
    /// the staged file cannot be written.
    pub async fn download<F>(
        &self,
        name: &str,
        version: u64,
        url: Url,
        on_progress: F,
    ) -> Result<StagedArchive, DownloadError>
    where
        F: FnMut(DownloadProgress),
    {
        let staged = self.staged(name, version);
        info!("Downloading {name}@{version} from {url}");

        let response =
            get_following_redirects(&self.client, url.clone(), self.max_redirects).await?;
        let status = response.status();
        if !status.is_success() {
            match write_body(response, &staged.path, &url, |_| {}).await {
                Ok(received) => {
                    debug!("Staged {received} byte {status} body for {name}@{version}");
                }
                Err(error) => debug!("Could not stage {status} body for {name}@{version}: {error}"),
            }
            return Err(NetworkError::Status {
                url: url.to_string(),
                status,
            }
            .into());
        }

        let received = write_body(response, &staged.path, &url, on_progress).await?;
        info!("Downloaded {name}@{version}: {received} bytes");
        Ok(staged)
    }
}

async fn write_body<F>(
    response: reqwest::Response,
    path: &Path,
    url: &Url,
    mut on_progress: F,
) -> Result<u64, DownloadError>
where
    F: FnMut(DownloadProgress),
{
    let total = declared_length(&response);
    let mut received: u64 = 0;

    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|error| DownloadError::io("failed to create archive", path, error))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| DownloadError::Stream {
            url: url.to_string(),
            source,
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|error| DownloadError::io("failed to write archive", path, error))?;
        received += chunk.len() as u64;
        on_progress(DownloadProgress { received, total });
    }

    file.flush()
        .await
        .map_err(|error| DownloadError::io("failed to flush archive", path, error))?;
    Ok(received)
}

fn declared_length(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(UNKNOWN_TOTAL)
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{DownloadError, DownloadManager, DownloadProgress};
    use crate::http::{NetworkError, build_client, url_with_query};

    fn manager(staging: &std::path::Path) -> DownloadManager {
        let client = build_client(None).expect("client should build");
        DownloadManager::new(client, staging.to_path_buf(), 5)
    }

    #[tokio::test]
    async fn download_streams_body_and_reports_progress() {
        let server = MockServer::start().await;
        let body = vec![7_u8; 4096];
        Mock::given(method("GET"))
            .and(path("/modules/stable/voice/3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = manager(temp.path());
        let url = url_with_query(&format!("{}/modules/stable/voice/3", server.uri()), &[])
            .expect("url should parse");

        let mut updates: Vec<DownloadProgress> = Vec::new();
        let staged = manager
            .download("voice", 3, url, |progress| updates.push(progress))
            .await
            .expect("download should succeed");

        assert_eq!(staged.path, temp.path().join("voice-3.zip"));
        assert_eq!(
            std::fs::read(&staged.path).expect("staged archive should exist"),
            body
        );
        let last = updates.last().expect("progress should be reported");
        assert_eq!(last.received, 4096);
        assert_eq!(last.total, 4096);
        assert!(updates.windows(2).all(|pair| pair[0].received <= pair[1].received));
    }

    #[tokio::test]
    async fn download_follows_redirect_chain_to_last_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/modules/stable/utils/2"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/cdn/hop"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/hop"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/cdn/utils.zip"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/utils.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"archive".to_vec()))
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let url = url_with_query(&format!("{}/modules/stable/utils/2", server.uri()), &[])
            .expect("url should parse");

        let staged = manager(temp.path())
            .download("utils", 2, url, |_| {})
            .await
            .expect("redirected download should succeed");

        assert_eq!(
            std::fs::read(&staged.path).expect("staged archive should exist"),
            b"archive"
        );
    }

    #[tokio::test]
    async fn download_reports_non_success_status_and_stages_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("gone for good"))
            .mount(&server)
            .await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let url = url_with_query(&format!("{}/modules/stable/gone/1", server.uri()), &[])
            .expect("url should parse");

        let result = manager(temp.path()).download("gone", 1, url, |_| {}).await;

        assert!(matches!(
            result,
            Err(DownloadError::Network(NetworkError::Status { status, .. })) if status.as_u16() == 404
        ));
        assert_eq!(
            std::fs::read(temp.path().join("gone-1.zip")).expect("failed body should be staged"),
            b"gone for good"
        );
    }

    #[test]
    fn reset_staging_removes_leftovers() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let staging = temp.path().join("pending");
        std::fs::create_dir_all(&staging).expect("staging dir should be created");
        std::fs::write(staging.join("voice-1.zip"), b"partial").expect("leftover should be written");

        let manager = manager(&staging);
        manager.reset_staging().expect("staging should reset");

        assert!(staging.is_dir());
        assert_eq!(
            std::fs::read_dir(&staging)
                .expect("staging should be readable")
                .count(),
            0
        );
    }

    #[test]
    fn staged_path_is_deterministic() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = manager(temp.path());

        assert_eq!(manager.staged("voice", 12), manager.staged("voice", 12));
        assert_eq!(
            manager.staged("voice", 12).path,
            temp.path().join("voice-12.zip")
        );
    }
}
