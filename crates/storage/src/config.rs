//! Storage backend configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which blob backend a DAG's runs read from and write to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Local disk, rooted at `directory`.
    File { directory: PathBuf },
    /// Amazon S3 bucket.
    S3 {
        bucket: String,
        region: String,
        #[serde(default)]
        root_dir: String,
    },
    /// Google Cloud Storage bucket.
    Gcs { bucket: String },
}

impl StorageConfig {
    /// Short backend name, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::File { .. } => "file",
            Self::S3 { .. } => "s3",
            Self::Gcs { .. } => "gcs",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_round_trips_through_tagged_json() {
        let json = r#"{"type":"file","directory":"/tmp/blobs"}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config,
            StorageConfig::File { directory: PathBuf::from("/tmp/blobs") }
        );
        assert_eq!(config.kind(), "file");
    }

    #[test]
    fn s3_root_dir_defaults_to_empty() {
        let json = r#"{"type":"s3","bucket":"b","region":"us-east-2"}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config, StorageConfig::S3 { ref root_dir, .. } if root_dir.is_empty()));
    }
}
