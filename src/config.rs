//! Configuration loading and types for DropVault.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, identity, upload planning, metadata persistence,
//! and the blob store that clients upload into.

use serde::Deserialize;
use std::path::Path;
use tracing::warn;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Identity settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Upload planning limits.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Metadata store settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Blob store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probe).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
///
/// Controls Prometheus metrics collection and the `/health` probe.
/// Both are enabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable the `/health` probe.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

/// Identity settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// `jwt` verifies bearer tokens, `none` treats every caller as
    /// [`AuthConfig::default_owner`].
    #[serde(default = "default_auth_mode")]
    pub mode: String,

    /// HMAC secret for HS256 tokens.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Lifetime of tokens minted by the dev issuer.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Owner assigned to uploads when auth is disabled.
    #[serde(default = "default_owner")]
    pub default_owner: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: default_auth_mode(),
            jwt_secret: default_jwt_secret(),
            token_ttl_secs: default_token_ttl(),
            default_owner: default_owner(),
        }
    }
}

impl AuthConfig {
    /// True when `jwt_secret` is still the built-in development value.
    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

/// Upload planning limits.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Declared sizes at or above this go multipart.
    #[serde(default = "default_five_gib")]
    pub multipart_threshold: u64,

    /// Size of every chunk except the last.
    #[serde(default = "default_five_gib")]
    pub chunk_size: u64,

    /// Largest declared size accepted.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Maximum number of parts the blob store accepts per upload.
    #[serde(default = "default_max_parts")]
    pub max_parts: u32,

    /// Validity of every access grant, in seconds.
    #[serde(default = "default_grant_ttl")]
    pub grant_ttl_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: default_five_gib(),
            chunk_size: default_five_gib(),
            max_file_size: default_max_file_size(),
            max_parts: default_max_parts(),
            grant_ttl_secs: default_grant_ttl(),
        }
    }
}

/// Metadata store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Backend type: `memory` or `dynamodb`.
    #[serde(default = "default_metadata_engine")]
    pub engine: String,

    /// DynamoDB-specific configuration.
    #[serde(default)]
    pub dynamodb: DynamoDbMetaConfig,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            engine: default_metadata_engine(),
            dynamodb: DynamoDbMetaConfig::default(),
        }
    }
}

/// DynamoDB metadata configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DynamoDbMetaConfig {
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint (e.g. LocalStack, DynamoDB Local).
    #[serde(default)]
    pub endpoint_url: String,
    /// Table holding one item per file.
    #[serde(default = "default_files_table")]
    pub files_table: String,
    /// Table holding one item per `(file, chunk)`.
    #[serde(default = "default_chunks_table")]
    pub chunks_table: String,
}

impl Default for DynamoDbMetaConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: String::new(),
            files_table: default_files_table(),
            chunks_table: default_chunks_table(),
        }
    }
}

/// Blob store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `memory` or `aws`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// In-process blob store configuration.
    #[serde(default)]
    pub memory: MemoryStorageConfig,

    /// AWS S3 configuration.
    #[serde(default)]
    pub aws: Option<AwsStorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            memory: MemoryStorageConfig::default(),
            aws: None,
        }
    }
}

/// In-process blob store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryStorageConfig {
    /// Base URL that minted grant URLs point at.
    #[serde(default = "default_memory_base_url")]
    pub base_url: String,
    /// HMAC key used to sign grant URLs.
    #[serde(default = "default_memory_signing_key")]
    pub signing_key: String,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            base_url: default_memory_base_url(),
            signing_key: default_memory_signing_key(),
        }
    }
}

/// AWS S3 configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AwsStorageConfig {
    /// Bucket clients upload into.
    pub bucket: String,
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Key prefix in the bucket.
    #[serde(default)]
    pub prefix: String,
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
    /// Explicit AWS access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key_id: String,
    /// Explicit AWS secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_access_key: String,
}

impl UploadConfig {
    /// Reject limits the planner cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("upload.chunk_size must be positive");
        }
        if self.multipart_threshold == 0 {
            anyhow::bail!("upload.multipart_threshold must be positive");
        }
        if self.max_parts == 0 {
            anyhow::bail!("upload.max_parts must be positive");
        }
        // Presigned SigV4 URLs are valid for at most seven days.
        if self.grant_ttl_secs == 0 || self.grant_ttl_secs > 604_800 {
            anyhow::bail!("upload.grant_ttl_secs must be between 1 and 604800");
        }
        Ok(())
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_auth_mode() -> String {
    "jwt".to_string()
}

/// Published default secret; anyone can mint tokens with it.
pub const DEV_JWT_SECRET: &str = "dropvault-dev-secret";

fn default_jwt_secret() -> String {
    DEV_JWT_SECRET.to_string()
}

fn default_token_ttl() -> u64 {
    86_400
}

fn default_owner() -> String {
    "default-user".to_string()
}

fn default_five_gib() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024 * 1024
}

fn default_max_parts() -> u32 {
    10_000
}

fn default_grant_ttl() -> u64 {
    900 // 15 minutes
}

fn default_metadata_engine() -> String {
    "memory".to_string()
}

fn default_files_table() -> String {
    "vibe-drop-files".to_string()
}

fn default_chunks_table() -> String {
    "vibe-drop-chunks".to_string()
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_memory_base_url() -> String {
    "http://localhost:8081/blobs".to_string()
}

fn default_memory_signing_key() -> String {
    "dropvault-blob-signing-key".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(
            "Config file {} not found, using built-in defaults",
            path.display()
        );
        return Ok(Config::default());
    }
    load_config(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.upload.multipart_threshold, 5_368_709_120);
        assert_eq!(config.upload.chunk_size, 5_368_709_120);
        assert_eq!(config.upload.max_file_size, 53_687_091_200);
        assert_eq!(config.upload.grant_ttl_secs, 900);
        assert_eq!(config.metadata.dynamodb.files_table, "vibe-drop-files");
        assert_eq!(config.auth.default_owner, "default-user");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  port: 9000\nupload:\n  chunk_size: 1048576\nstorage:\n  backend: aws\n  aws:\n    bucket: drops"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.upload.chunk_size, 1_048_576);
        assert_eq!(config.upload.multipart_threshold, 5_368_709_120);
        assert_eq!(config.storage.backend, "aws");
        let aws = config.storage.aws.unwrap();
        assert_eq!(aws.bucket, "drops");
        assert_eq!(aws.region, "us-east-1");
    }

    #[test]
    fn test_upload_limits_validation() {
        assert!(UploadConfig::default().validate().is_ok());

        let zero_chunk = UploadConfig {
            chunk_size: 0,
            ..UploadConfig::default()
        };
        assert!(zero_chunk.validate().is_err());

        let long_ttl = UploadConfig {
            grant_ttl_secs: 8 * 86_400,
            ..UploadConfig::default()
        };
        assert!(long_ttl.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.metadata.engine, "memory");
    }
}
