//! Namespace and version providers

use crate::domain::{NamespaceProvider, VersionProvider};
use crate::error::{Error, Result};
use std::path::PathBuf;

/// Environment variable naming the namespace the operator installs into
pub const WATCH_NAMESPACE_ENV: &str = "WATCH_NAMESPACE";

/// Reads the install namespace from `WATCH_NAMESPACE` on every call
#[derive(Debug, Clone, Default)]
pub struct EnvNamespaceProvider;

impl NamespaceProvider for EnvNamespaceProvider {
    fn namespace(&self) -> Result<String> {
        match std::env::var(WATCH_NAMESPACE_ENV) {
            Ok(ns) if !ns.trim().is_empty() => Ok(ns.trim().to_string()),
            _ => Err(Error::Namespace(format!("{} must be set", WATCH_NAMESPACE_ENV))),
        }
    }
}

/// Fixed namespace, an empty one is an error
#[derive(Debug, Clone)]
pub struct StaticNamespaceProvider(pub String);

impl NamespaceProvider for StaticNamespaceProvider {
    fn namespace(&self) -> Result<String> {
        if self.0.is_empty() {
            return Err(Error::Namespace("namespace is empty".to_string()));
        }
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
pub struct StaticVersionProvider(pub String);

impl VersionProvider for StaticVersionProvider {
    fn version(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// First line of a version file, read on every call
#[derive(Debug, Clone)]
pub struct FileVersionProvider {
    path: PathBuf,
}

impl FileVersionProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl VersionProvider for FileVersionProvider {
    fn version(&self) -> Result<String> {
        let contents = std::fs::read_to_string(&self.path)?;
        let version = contents.lines().next().unwrap_or_default().trim();
        if version.is_empty() {
            return Err(Error::Configuration(format!(
                "version file {} is empty",
                self.path.display()
            )));
        }
        Ok(version.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_file_version_first_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "v1.0.3\nbuilt by ci").unwrap();
        let provider = FileVersionProvider::new(file.path());
        assert_eq!(provider.version().unwrap(), "v1.0.3");
    }

    #[test]
    fn test_file_version_errors() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let provider = FileVersionProvider::new(file.path());
        assert_matches!(provider.version(), Err(Error::Configuration(_)));

        let dir = tempfile::tempdir().unwrap();
        let provider = FileVersionProvider::new(dir.path().join("missing"));
        assert_matches!(provider.version(), Err(Error::Io(_)));
    }

    #[test]
    fn test_static_providers() {
        assert_eq!(StaticNamespaceProvider("hpp".into()).namespace().unwrap(), "hpp");
        assert_matches!(
            StaticNamespaceProvider(String::new()).namespace(),
            Err(Error::Namespace(_))
        );
        assert_eq!(StaticVersionProvider("1.0.0".into()).version().unwrap(), "1.0.0");
    }
}
