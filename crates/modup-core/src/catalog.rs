use std::collections::BTreeMap;
use std::path::{Component, Path};

use log::{debug, info};
use modup_platform::Platform;
use reqwest::Url;

use crate::http::{NetworkError, get_following_redirects, url_with_query};

/// Remote module name to latest published version.
pub type RemoteVersions = BTreeMap<String, u64>;

/// Whether `name` can be used as a module directory and URL segment: a
/// single plain path component with no separators.
#[must_use]
pub fn is_valid_module_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    !name.contains(['/', '\\', '\0'])
        && matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        )
}

/// Query parameters attached to every catalog and archive request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogQuery {
    pub host_version: String,
    pub platform: Platform,
}

impl CatalogQuery {
    #[must_use]
    pub fn new(host_version: impl Into<String>, platform: Platform) -> Self {
        Self {
            host_version: host_version.into(),
            platform,
        }
    }

    fn pairs(&self) -> [(&str, &str); 2] {
        [
            ("host_version", self.host_version.as_str()),
            ("platform", self.platform.as_str()),
        ]
    }
}

#[derive(Clone)]
pub struct RemoteCatalog {
    client: reqwest::Client,
    endpoint: String,
    channel: String,
    max_redirects: usize,
}

impl RemoteCatalog {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        channel: impl Into<String>,
        max_redirects: usize,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            channel: channel.into(),
            max_redirects,
        }
    }

    /// `{endpoint}/modules/{channel}/versions.json?host_version=..&platform=..`
    ///
    /// # Errors
    /// Returns an error if the configured endpoint is not a valid URL.
    pub fn versions_url(&self, query: &CatalogQuery) -> Result<Url, NetworkError> {
        url_with_query(
            &format!("{}/modules/{}/versions.json", self.endpoint, self.channel),
            &query.pairs(),
        )
    }

    /// `{endpoint}/modules/{channel}/{name}/{version}?host_version=..&platform=..`
    /// with `name` percent-encoded as one path segment.
    ///
    /// # Errors
    /// Returns an error if the configured endpoint is not a valid URL.
    pub fn module_url(
        &self,
        name: &str,
        version: u64,
        query: &CatalogQuery,
    ) -> Result<Url, NetworkError> {
        let mut url = url_with_query(
            &format!("{}/modules/{}", self.endpoint, self.channel),
            &query.pairs(),
        )?;
        url.path_segments_mut()
            .map_err(|()| NetworkError::InvalidUrl {
                url: self.endpoint.clone(),
                details: "endpoint cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .push(name)
            .push(&version.to_string());
        Ok(url)
    }

    /// Fetch the remote version map for the configured channel.
    ///
    /// # Errors
    /// Returns an error on transport failure, a non-2xx final response, or a
    /// body that is not a JSON object of integer versions.
    pub async fn fetch_versions(
        &self,
        query: &CatalogQuery,
    ) -> Result<RemoteVersions, NetworkError> {
        let url = self.versions_url(query)?;
        debug!("Fetching module versions from {url}");

        let response =
            get_following_redirects(&self.client, url.clone(), self.max_redirects).await?;
        if !response.status().is_success() {
            return Err(NetworkError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let versions: RemoteVersions =
            response.json().await.map_err(|source| NetworkError::Parse {
                url: url.to_string(),
                source,
            })?;

        info!("Remote catalog lists {} modules", versions.len());
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use modup_platform::Platform;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{CatalogQuery, RemoteCatalog, is_valid_module_name};
    use crate::http::{NetworkError, build_client};

    fn catalog(endpoint: &str) -> RemoteCatalog {
        let client = build_client(None).expect("client should build");
        RemoteCatalog::new(client, endpoint, "stable", 5)
    }

    fn query() -> CatalogQuery {
        CatalogQuery::new("1.0.17", Platform::Linux)
    }

    #[test]
    fn module_url_uses_channel_name_and_version() {
        let url = catalog("https://updates.test/")
            .module_url("voice", 7, &query())
            .expect("url should build");

        assert_eq!(
            url.as_str(),
            "https://updates.test/modules/stable/voice/7?host_version=1.0.17&platform=linux"
        );
    }

    #[test]
    fn module_url_encodes_name_as_single_segment() {
        let url = catalog("https://updates.test/api")
            .module_url("../voice beta", 2, &query())
            .expect("url should build");

        assert_eq!(
            url.as_str(),
            "https://updates.test/api/modules/stable/..%2Fvoice%20beta/2?host_version=1.0.17&platform=linux"
        );
    }

    #[test]
    fn module_names_must_be_single_plain_components() {
        assert!(is_valid_module_name("desktop_core"));
        assert!(is_valid_module_name("voice.v2"));

        for name in ["", ".", "..", "../../escaped", "a/b", "a\\b", "/abs", "nul\0"] {
            assert!(!is_valid_module_name(name), "{name:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn fetch_versions_parses_map() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/modules/stable/versions.json"))
            .and(query_param("host_version", "1.0.17"))
            .and(query_param("platform", "linux"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "desktop_core": 3,
                "voice": 12
            })))
            .expect(1)
            .mount(&server)
            .await;

        let versions = catalog(&server.uri())
            .fetch_versions(&query())
            .await
            .expect("catalog should load");

        assert_eq!(versions.len(), 2);
        assert_eq!(versions.get("voice"), Some(&12));
    }

    #[tokio::test]
    async fn fetch_versions_follows_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/modules/stable/versions.json"))
            .respond_with(
                ResponseTemplate::new(307).insert_header("Location", "/mirror/versions.json"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mirror/versions.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "utils": 1 })))
            .mount(&server)
            .await;

        let versions = catalog(&server.uri())
            .fetch_versions(&query())
            .await
            .expect("redirected catalog should load");

        assert_eq!(versions.get("utils"), Some(&1));
    }

    #[tokio::test]
    async fn fetch_versions_reports_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = catalog(&server.uri()).fetch_versions(&query()).await;

        assert!(matches!(
            result,
            Err(NetworkError::Status { status, .. }) if status.as_u16() == 503
        ));
    }

    #[tokio::test]
    async fn fetch_versions_rejects_non_integer_versions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "voice": "latest" })))
            .mount(&server)
            .await;

        let result = catalog(&server.uri()).fetch_versions(&query()).await;

        assert!(matches!(result, Err(NetworkError::Parse { .. })));
    }
}
