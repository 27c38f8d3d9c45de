use serde::{Deserialize, Serialize};

/// Platform tag sent to the update server as the `platform` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Osx,
    Linux,
    Win,
}

impl Platform {
    #[must_use]
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Win
        } else if cfg!(target_os = "macos") {
            Self::Osx
        } else {
            Self::Linux
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Osx => "osx",
            Self::Linux => "linux",
            Self::Win => "win",
        }
    }

    /// Whether the host executable can be replaced by the platform updater.
    /// Linux builds are distributed through package managers and only get a
    /// manual download prompt.
    #[must_use]
    pub fn supports_host_install(self) -> bool {
        !matches!(self, Self::Linux)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::Platform;

    #[test]
    fn query_tags_match_server_names() {
        assert_eq!(Platform::Osx.as_str(), "osx");
        assert_eq!(Platform::Linux.as_str(), "linux");
        assert_eq!(Platform::Win.as_str(), "win");
        assert_eq!(Platform::Win.to_string(), "win");
    }

    #[test]
    fn only_linux_lacks_host_install() {
        assert!(Platform::Osx.supports_host_install());
        assert!(Platform::Win.supports_host_install());
        assert!(!Platform::Linux.supports_host_install());
    }

    #[test]
    fn current_platform_matches_target() {
        let current = Platform::current();
        if cfg!(target_os = "linux") {
            assert_eq!(current, Platform::Linux);
        }
        if cfg!(target_os = "macos") {
            assert_eq!(current, Platform::Osx);
        }
    }
}
