use std::time::Duration;

use log::debug;
use reqwest::Url;
use reqwest::header::LOCATION;
use thiserror::Error;

pub const DEFAULT_MAX_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("invalid URL {url}: {details}")]
    InvalidUrl { url: String, details: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} failed with HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("gave up after {hops} redirects starting at {url}")]
    TooManyRedirects { url: String, hops: usize },
    #[error("failed to parse response from {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl NetworkError {
    fn request(url: &Url, source: reqwest::Error) -> Self {
        Self::Request {
            url: url.to_string(),
            source,
        }
    }
}

/// Build the client shared by the catalog, downloads and the host feed.
///
/// Automatic redirects are disabled: every caller goes through
/// [`get_following_redirects`] so the hop count stays bounded.
///
/// # Errors
/// Returns an error if the TLS backend cannot be initialized.
pub fn build_client(timeout: Option<Duration>) -> Result<reqwest::Client, NetworkError> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(format!("modup/{}", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(NetworkError::ClientBuild)
}

/// Parse `base` and append query pairs.
///
/// # Errors
/// Returns [`NetworkError::InvalidUrl`] when `base` is not an absolute URL.
pub fn url_with_query(base: &str, query: &[(&str, &str)]) -> Result<Url, NetworkError> {
    let parsed = if query.is_empty() {
        Url::parse(base)
    } else {
        Url::parse_with_params(base, query)
    };
    parsed.map_err(|error| NetworkError::InvalidUrl {
        url: base.to_string(),
        details: error.to_string(),
    })
}

/// Issue a GET and re-issue it against each `Location` of a 3xx response
/// until a non-redirect response arrives.
///
/// At most `max_redirects` hops are followed; a cyclic chain ends with
/// [`NetworkError::TooManyRedirects`]. A 3xx without a usable `Location` is
/// returned as the final response. The returned response is not checked for
/// success.
///
/// # Errors
/// Returns an error on transport failure or when the hop limit is exceeded.
pub async fn get_following_redirects(
    client: &reqwest::Client,
    url: Url,
    max_redirects: usize,
) -> Result<reqwest::Response, NetworkError> {
    let origin = url.to_string();
    let mut current = url;

    for hop in 0..=max_redirects {
        let response = client
            .get(current.clone())
            .send()
            .await
            .map_err(|error| NetworkError::request(&current, error))?;

        if !response.status().is_redirection() {
            return Ok(response);
        }

        let Some(next) = redirect_target(&current, &response) else {
            return Ok(response);
        };

        debug!(
            "Redirect {} ({}): {current} -> {next}",
            hop + 1,
            response.status()
        );
        current = next;
    }

    Err(NetworkError::TooManyRedirects {
        url: origin,
        hops: max_redirects,
    })
}

fn redirect_target(current: &Url, response: &reqwest::Response) -> Option<Url> {
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    current.join(location).ok()
}
