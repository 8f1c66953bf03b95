use serde::{Deserialize, Serialize};

use crate::config::EnvVars;

pub const DEFAULT_STORAGE_REGION: &str = "us-east-1";

pub const DEFAULT_PUBLIC_HOST: &str = "https://storage.googleapis.com";

const LOCAL_BUCKET: &str = "token-content-local";
const LOCAL_ENDPOINT: &str = "http://127.0.0.1:9000";
const LOCAL_ACCESS_KEY: &str = "minioadmin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    /// Token content bucket
    pub bucket: String,
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub path_style: bool,
    /// Origin of public artifact URLs: `<public_host>/<bucket>/<object>`
    pub public_host: String,
}

impl StorageConfig {
    pub fn from_env_vars(env: &EnvVars) -> anyhow::Result<Self> {
        let endpoint = match env.get("STORAGE_ENDPOINT") {
            Some(endpoint) => Some(endpoint.to_string()),
            None if env.is_local() => Some(LOCAL_ENDPOINT.to_string()),
            None => None,
        };

        Ok(Self {
            endpoint,
            region: env
                .get("STORAGE_REGION")
                .unwrap_or(DEFAULT_STORAGE_REGION)
                .to_string(),
            bucket: env.required("GCLOUD_TOKEN_CONTENT_BUCKET", LOCAL_BUCKET)?,
            access_key: env.required("STORAGE_ACCESS_KEY", LOCAL_ACCESS_KEY)?,
            secret_key: env.required("STORAGE_SECRET_KEY", LOCAL_ACCESS_KEY)?,
            path_style: env.parse_or("STORAGE_PATH_STYLE", env.is_local())?,
            public_host: env
                .get("STORAGE_PUBLIC_HOST")
                .unwrap_or(DEFAULT_PUBLIC_HOST)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            public_host: endpoint.clone(),
            endpoint: Some(endpoint),
            region: DEFAULT_STORAGE_REGION.to_string(),
            bucket: bucket.into(),
            access_key: LOCAL_ACCESS_KEY.to_string(),
            secret_key: LOCAL_ACCESS_KEY.to_string(),
            path_style: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::for_minio(LOCAL_ENDPOINT, LOCAL_BUCKET)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000", "test-bucket");
        assert_eq!(config.endpoint, Some("http://localhost:9000".to_string()));
        assert_eq!(config.bucket, "test-bucket");
        assert!(config.path_style);
        assert_eq!(config.public_host, "http://localhost:9000");
    }

    #[test]
    fn test_production_requires_bucket_and_credentials() {
        let env = EnvVars::from_pairs([("ENV", "production")]);
        assert!(StorageConfig::from_env_vars(&env).is_err());

        let env = EnvVars::from_pairs([
            ("ENV", "production"),
            ("GCLOUD_TOKEN_CONTENT_BUCKET", "content"),
            ("STORAGE_ACCESS_KEY", "key"),
            ("STORAGE_SECRET_KEY", "secret"),
            ("STORAGE_PUBLIC_HOST", "https://cdn.example/"),
        ]);
        let config = StorageConfig::from_env_vars(&env).unwrap();
        assert_eq!(config.endpoint, None);
        assert!(!config.path_style);
        assert_eq!(config.public_host, "https://cdn.example");
    }
}
