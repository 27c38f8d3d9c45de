use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use log::{debug, info};
use modup_platform::Platform;
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::{NetworkError, get_following_redirects, url_with_query};

/// Payload of the `manual` event: a newer host exists but has to be
/// installed by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualUpdate {
    pub current_version: String,
    pub latest_version: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostUpdateStatus {
    UpToDate,
    /// A newer host is ready; `quit_and_install` applies it.
    Ready { version: String },
    Manual(ManualUpdate),
}

#[derive(Debug, Error)]
pub enum HostUpdateError {
    #[error("host update feed URL has not been set")]
    FeedNotSet,
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("no host update is ready to install")]
    NothingPending,
    #[error("failed to launch host update {url}: {source}")]
    Launch {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait HostUpdater: Send + Sync {
    fn set_feed_url(&self, url: String);

    /// Poll the feed once.
    async fn check(&self) -> Result<HostUpdateStatus, HostUpdateError>;

    fn quit_and_install(&self) -> Result<(), HostUpdateError>;
}

#[derive(Debug, Deserialize)]
struct FeedRelease {
    name: String,
    url: String,
    #[serde(default)]
    notes: Option<String>,
}

/// Polls a release feed that answers `204` when the host is current and a
/// JSON `{ "name": "<version>", "url": "...", "notes": "..." }` otherwise.
pub struct FeedHostUpdater {
    client: reqwest::Client,
    current_version: String,
    platform: Platform,
    max_redirects: usize,
    feed_url: RwLock<Option<String>>,
    pending: Mutex<Option<FeedRelease>>,
}

impl FeedHostUpdater {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        current_version: impl Into<String>,
        platform: Platform,
        max_redirects: usize,
    ) -> Self {
        Self {
            client,
            current_version: current_version.into(),
            platform,
            max_redirects,
            feed_url: RwLock::new(None),
            pending: Mutex::new(None),
        }
    }

    fn feed_url(&self) -> Option<String> {
        self.feed_url
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl HostUpdater for FeedHostUpdater {
    fn set_feed_url(&self, url: String) {
        debug!("Host update feed: {url}");
        *self.feed_url.write().unwrap_or_else(PoisonError::into_inner) = Some(url);
    }

    async fn check(&self) -> Result<HostUpdateStatus, HostUpdateError> {
        let feed = self.feed_url().ok_or(HostUpdateError::FeedNotSet)?;
        let url = url_with_query(&feed, &[])?;

        let response =
            get_following_redirects(&self.client, url.clone(), self.max_redirects).await?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(HostUpdateStatus::UpToDate);
        }
        if !response.status().is_success() {
            return Err(NetworkError::Status {
                url: url.to_string(),
                status: response.status(),
            }
            .into());
        }

        let release: FeedRelease = response.json().await.map_err(|source| NetworkError::Parse {
            url: url.to_string(),
            source,
        })?;

        let latest = release.name.strip_prefix('v').unwrap_or(&release.name);
        let current = self
            .current_version
            .strip_prefix('v')
            .unwrap_or(&self.current_version);

        if !is_newer_version(latest, current) {
            debug!("Host {current} is current (feed offers {latest})");
            return Ok(HostUpdateStatus::UpToDate);
        }

        if !self.platform.supports_host_install() {
            info!("Host update {latest} requires a manual install");
            return Ok(HostUpdateStatus::Manual(ManualUpdate {
                current_version: current.to_string(),
                latest_version: latest.to_string(),
                url: release.url,
            }));
        }

        info!(
            "Host update {latest} ready{}",
            release
                .notes
                .as_deref()
                .map(|notes| format!(": {notes}"))
                .unwrap_or_default()
        );
        let version = latest.to_string();
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(release);
        Ok(HostUpdateStatus::Ready { version })
    }

    fn quit_and_install(&self) -> Result<(), HostUpdateError> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let release = pending.as_ref().ok_or(HostUpdateError::NothingPending)?;
        info!("Handing host update {} to the system", release.name);
        open::that_detached(&release.url).map_err(|source| HostUpdateError::Launch {
            url: release.url.clone(),
            source,
        })
    }
}

/// Semver comparison that tolerates short forms like `1.2` or `1`.
#[must_use]
pub fn is_newer_version(latest: &str, current: &str) -> bool {
    match (parse_version(latest), parse_version(current)) {
        (Some(latest), Some(current)) => latest > current,
        _ => latest != current,
    }
}

fn parse_version(version: &str) -> Option<Version> {
    if let Ok(parsed) = Version::parse(version) {
        return Some(parsed);
    }

    let split = version.find(['-', '+']).unwrap_or(version.len());
    let (core, suffix) = version.split_at(split);
    let mut parts = core.split('.');
    let major = parts.next()?.parse::<u64>().ok()?;
    let minor = match parts.next() {
        Some(part) => part.parse::<u64>().ok()?,
        None => 0,
    };
    let patch = match parts.next() {
        Some(part) => part.parse::<u64>().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }

    Version::parse(&format!("{major}.{minor}.{patch}{suffix}")).ok()
}
