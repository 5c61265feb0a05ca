use camino::Utf8PathBuf;
use serde::Deserialize;

/// Settings for [`Workflow::run`](crate::Workflow::run).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Root of the per-node working directories.
    pub base_dir: Utf8PathBuf,
    /// Reuse the stored result of a node whose inputs did not change.
    pub use_cache: bool,
    /// Run independent nodes concurrently on the rayon pool.
    pub parallel: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_dir: Utf8PathBuf::from("work"),
            use_cache: true,
            parallel: true,
        }
    }
}

impl RunConfig {
    pub fn new(base_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json() {
        let config = RunConfig::from_json(r#"{ "base_dir": "/scratch", "parallel": false }"#).unwrap();
        assert_eq!(config.base_dir, "/scratch");
        assert!(config.use_cache);
        assert!(!config.parallel);
    }

    #[test]
    fn test_unknown_type() {
        assert!(RunConfig::from_json(r#"{ "use_cache": "yes" }"#).is_err());
    }
}
