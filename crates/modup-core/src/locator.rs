use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use log::debug;

/// Ordered list of directories modules are loaded from.
#[derive(Debug, Default)]
pub struct ModuleLocator {
    roots: RwLock<Vec<PathBuf>>,
}

impl ModuleLocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `root` unless it is already registered.
    pub fn add_root(&self, root: impl Into<PathBuf>) -> bool {
        let root = root.into();
        let mut roots = self.roots.write().unwrap_or_else(PoisonError::into_inner);
        if roots.contains(&root) {
            return false;
        }
        debug!("Added module search root {}", root.display());
        roots.push(root);
        true
    }

    #[must_use]
    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// First `<root>/<name>` directory in registration order.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|root| root.join(name))
            .find(|candidate| candidate.is_dir())
    }

    #[must_use]
    pub fn contains_root(&self, root: &Path) -> bool {
        self.roots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|existing| existing == root)
    }
}

#[cfg(test)]
mod tests {
    use super::ModuleLocator;

    #[test]
    fn roots_are_added_once_in_order() {
        let locator = ModuleLocator::new();
        assert!(locator.add_root("/opt/app/modules"));
        assert!(locator.add_root("/home/user/.local/modules"));
        assert!(!locator.add_root("/opt/app/modules"));

        assert_eq!(locator.roots().len(), 2);
        assert!(locator.contains_root(std::path::Path::new("/opt/app/modules")));
    }

    #[test]
    fn resolve_prefers_earlier_roots() {
        let first = tempfile::tempdir().expect("tempdir should be created");
        let second = tempfile::tempdir().expect("tempdir should be created");
        std::fs::create_dir_all(second.path().join("voice")).expect("module dir should be created");
        std::fs::create_dir_all(second.path().join("utils")).expect("module dir should be created");
        std::fs::create_dir_all(first.path().join("utils")).expect("module dir should be created");

        let locator = ModuleLocator::new();
        locator.add_root(first.path());
        locator.add_root(second.path());

        assert_eq!(locator.resolve("utils"), Some(first.path().join("utils")));
        assert_eq!(locator.resolve("voice"), Some(second.path().join("voice")));
        assert_eq!(locator.resolve("missing"), None);
    }
}
