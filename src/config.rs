//! Tracer configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::util::{Result, TracerError};

/// Environment variable overriding [`TracerConfig::kernel_source`].
pub const KERNEL_ENV: &str = "PATHTRACE_KERNEL";

/// Settings shared by every tracer of a render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Kernel source file, read on every setup
    pub kernel_source: PathBuf,
    /// Kernel entry point
    pub entry_point: String,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            kernel_source: PathBuf::from("kernels/trace.wgsl"),
            entry_point: "trace_pixel".to_string(),
        }
    }
}

impl TracerConfig {
    /// Load settings from a JSON file; missing fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| TracerError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| TracerError::ConfigFormat {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save settings as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|source| TracerError::ConfigFormat {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| TracerError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, with the kernel path taken from `PATHTRACE_KERNEL` when set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(KERNEL_ENV).filter(|p| !p.is_empty()) {
            config.kernel_source = PathBuf::from(path);
        }
        config
    }

    pub fn with_kernel_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel_source = path.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TracerConfig::default();
        assert_eq!(config.kernel_source, PathBuf::from("kernels/trace.wgsl"));
        assert_eq!(config.entry_point, "trace_pixel");
    }

    #[test]
    fn test_partial_json() {
        let config: TracerConfig = serde_json::from_str(r#"{ "entry_point": "main" }"#).unwrap();
        assert_eq!(config.entry_point, "main");
        assert_eq!(config.kernel_source, TracerConfig::default().kernel_source);
    }

    #[test]
    fn test_load_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracer.json");
        let config = TracerConfig::default().with_kernel_source("/opt/kernels/pt.wgsl");
        config.save(&path).unwrap();
        assert_eq!(TracerConfig::load(&path).unwrap(), config);

    }

    #[test]
    fn test_load_errors_keep_cause() {
        use std::error::Error as _;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracer.json");
        std::fs::write(&path, "{ not json").unwrap();
        match TracerConfig::load(&path) {
            Err(err @ TracerError::ConfigFormat { .. }) => {
                let source = err.source().expect("parse error keeps its serde cause");
                assert!(source.downcast_ref::<serde_json::Error>().is_some());
                assert!(err.to_string().contains("tracer.json"));
            }
            other => panic!("Expected ConfigFormat, got {other:?}"),
        }

        let missing = dir.path().join("missing.json");
        match TracerConfig::load(&missing) {
            Err(err @ TracerError::ConfigIo { .. }) => {
                let source = err.source().expect("read error keeps its io cause");
                let io = source.downcast_ref::<std::io::Error>().expect("io cause");
                assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
                if let TracerError::ConfigIo { path, .. } = &err {
                    assert_eq!(path, &missing);
                }
            }
            other => panic!("Expected ConfigIo, got {other:?}"),
        }

        // saving into a directory that does not exist
        let err = TracerConfig::default()
            .save(dir.path().join("no/such/dir/tracer.json"))
            .unwrap_err();
        assert!(matches!(err, TracerError::ConfigIo { .. }));
        assert!(err.source().is_some());
    }
}
