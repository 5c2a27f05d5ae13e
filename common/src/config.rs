use config::{Config, ConfigError};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Root holding the raw song and log prefixes, e.g. `s3://udacity-dend`.
    pub input_root: String,
    /// Root the star-schema tables are written beneath.
    pub output_root: String,
    #[serde(default = "default_song_data_prefix")]
    pub song_data_prefix: String,
    #[serde(default = "default_log_data_prefix")]
    pub log_data_prefix: String,
    /// When false the pipeline derives and counts every table but writes nothing.
    #[serde(default = "default_true")]
    pub write_output: bool,
    /// Delete each table's existing output before writing it. Writing without
    /// purging would append a second copy of every table, so it is rejected.
    #[serde(default = "default_true")]
    pub purge_output: bool,
    #[serde(default)]
    pub target_partitions: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
    #[serde(default = "default_true")]
    pub verify_buckets: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: default_region(),
            access_key: None,
            secret_key: None,
            allow_http: false,
            verify_buckets: true,
        }
    }
}

fn default_song_data_prefix() -> String {
    "song_data".to_string()
}

fn default_log_data_prefix() -> String {
    "log_data".to_string()
}

fn default_region() -> String {
    "us-west-2".to_string()
}

fn default_true() -> bool {
    true
}

impl PipelineConfig {
    pub fn song_data_location(&self) -> String {
        join_location(&self.input_root, &self.song_data_prefix)
    }

    pub fn log_data_location(&self) -> String {
        join_location(&self.input_root, &self.log_data_prefix)
    }

    pub fn table_location(&self, table: &str) -> String {
        join_location(&self.output_root, table)
    }
}

/// Joins a root and a relative prefix into a directory location ending in `/`.
pub fn join_location(root: &str, prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/", root.trim_end_matches('/'))
    } else {
        format!("{}/{}/", root.trim_end_matches('/'), prefix)
    }
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("SPARKIFY")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Build the configuration
        let config = builder.build()?;

        let settings: Settings = config.try_deserialize()?;
        if settings.pipeline.write_output && !settings.pipeline.purge_output {
            return Err(ConfigError::Message(
                "purge_output = false requires write_output = false: writing without purging appends to existing tables"
                    .to_string(),
            ));
        }

        debug!(
            input_root = %settings.pipeline.input_root,
            output_root = %settings.pipeline.output_root,
            write_output = settings.pipeline.write_output,
            "Parsed pipeline settings"
        );

        Ok(settings)
    }
}
