/*!
 * Configuration support for NPPES ingestion
 *
 * Every tunable of a run lives here. A configuration is built once at process
 * start and handed to each component explicitly.
 */

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_TARGET_CODES, MAX_API_PAGE_SIZE, TAXONOMY_CODE_COLUMN_BASE};

/// Environment variable prefix, e.g. `NPPES_INGEST__POLLER__PAGE_SIZE=100`
pub const ENV_PREFIX: &str = "NPPES_INGEST";

/// Top-level configuration for an ingestion process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

/// Bulk file filtering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Rows per chunk handed to a worker
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Worker count (None = number of available processing units)
    #[serde(default)]
    pub parallel_threads: Option<usize>,

    /// Column base name; slots are `<base>_1` through `<base>_15`
    #[serde(default = "default_taxonomy_column_base")]
    pub taxonomy_column_base: String,

    /// Taxonomy codes a row must carry to be kept
    #[serde(default = "default_target_codes")]
    pub target_codes: Vec<String>,

    /// Whether to show a progress bar while scanning
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

/// NPI Registry API polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_query_terms")]
    pub query_terms: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_skip")]
    pub max_skip: usize,
    #[serde(default = "default_max_total_per_term")]
    pub max_total_per_term: usize,
    #[serde(default = "default_max_requests_per_term")]
    pub max_requests_per_term: usize,
    /// Attempts per page, including the first
    #[serde(default = "default_retry_limit")]
    pub retry_limit: usize,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_rate_limit_delay_secs")]
    pub rate_limit_delay_secs: u64,
    #[serde(default = "default_run_time_limit_secs")]
    pub run_time_limit_secs: u64,
    #[serde(default = "default_pause_duration_secs")]
    pub pause_duration_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Run envelope and sink batching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Wait after a failed run before the caller may trigger again
    #[serde(default = "default_failure_delay_secs")]
    pub failure_delay_secs: u64,
    /// Records per sink upsert call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Dissemination archive download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Archive URL (None = current month's dissemination file)
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    #[serde(default = "default_archive_timeout_secs")]
    pub timeout_secs: u64,
    /// Keep the zip after extraction
    #[serde(default)]
    pub keep_archive: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            parallel_threads: None,
            taxonomy_column_base: default_taxonomy_column_base(),
            target_codes: default_target_codes(),
            show_progress: true,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_version: default_api_version(),
            query_terms: default_query_terms(),
            page_size: default_page_size(),
            max_skip: default_max_skip(),
            max_total_per_term: default_max_total_per_term(),
            max_requests_per_term: default_max_requests_per_term(),
            retry_limit: default_retry_limit(),
            retry_delay_secs: default_retry_delay_secs(),
            rate_limit_delay_secs: default_rate_limit_delay_secs(),
            run_time_limit_secs: default_run_time_limit_secs(),
            pause_duration_secs: default_pause_duration_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            failure_delay_secs: default_failure_delay_secs(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            url: None,
            work_dir: default_work_dir(),
            file_prefix: default_file_prefix(),
            file_extension: default_file_extension(),
            timeout_secs: default_archive_timeout_secs(),
            keep_archive: false,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    100_000
}

fn default_taxonomy_column_base() -> String {
    TAXONOMY_CODE_COLUMN_BASE.to_string()
}

fn default_target_codes() -> Vec<String> {
    DEFAULT_TARGET_CODES.iter().map(|c| c.to_string()).collect()
}

fn default_api_url() -> String {
    "https://npiregistry.cms.hhs.gov/api/".to_string()
}

fn default_api_version() -> String {
    "2.1".to_string()
}

fn default_query_terms() -> Vec<String> {
    vec![
        "Substance Abuse Rehabilitation Facility".to_string(),
        "Mental Health".to_string(),
    ]
}

fn default_page_size() -> usize {
    200
}

fn default_max_skip() -> usize {
    1000
}

fn default_max_total_per_term() -> usize {
    1200
}

fn default_max_requests_per_term() -> usize {
    6
}

fn default_retry_limit() -> usize {
    3
}

fn default_retry_delay_secs() -> u64 {
    2
}

fn default_rate_limit_delay_secs() -> u64 {
    1
}

fn default_run_time_limit_secs() -> u64 {
    4 * 60 * 60
}

fn default_pause_duration_secs() -> u64 {
    2 * 60 * 60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("nppes-ingest/{}", env!("CARGO_PKG_VERSION"))
}

fn default_failure_delay_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    500
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("nppes_data")
}

fn default_file_prefix() -> String {
    "npidata".to_string()
}

fn default_file_extension() -> String {
    "csv".to_string()
}

fn default_archive_timeout_secs() -> u64 {
    60 * 60
}

impl PollerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_secs(self.rate_limit_delay_secs)
    }

    pub fn run_time_limit(&self) -> Duration {
        Duration::from_secs(self.run_time_limit_secs)
    }

    pub fn pause_duration(&self) -> Duration {
        Duration::from_secs(self.pause_duration_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl OrchestratorConfig {
    pub fn failure_delay(&self) -> Duration {
        Duration::from_secs(self.failure_delay_secs)
    }
}

impl IngestConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file only
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| crate::IngestError::io_at(e, path.as_ref()))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| crate::IngestError::Configuration {
                message: format!("Failed to parse config file: {}", e),
                suggestion: Some("Check that the file is valid TOML format".to_string()),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| crate::IngestError::Configuration {
                message: format!("Failed to serialize config: {}", e),
                suggestion: None,
            })?;
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| crate::IngestError::io_at(e, parent))?;
        }
        std::fs::write(path, contents).map_err(|e| crate::IngestError::io_at(e, path))?;
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/nppes-ingest/config.toml` on Unix-like systems
    /// or `%APPDATA%\nppes-ingest\config.toml` on Windows
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "nppes-ingest")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load configuration in layers
    ///
    /// Priority order (later wins):
    /// 1. Built-in defaults
    /// 2. The given file, or the default config file if it exists
    /// 3. `NPPES_INGEST__<SECTION>__<KEY>` environment variables
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(default_path) = Self::default_config_path() {
                    builder = builder.add_source(config::File::from(default_path).required(false));
                }
            }
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("filter.target_codes")
                    .with_list_parse_key("poller.query_terms")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a run meaningless
    pub fn validate(&self) -> crate::Result<()> {
        use crate::IngestError;

        if self.filter.chunk_size == 0 {
            return Err(IngestError::invalid_config("filter.chunk_size must be greater than 0", None));
        }
        if self.filter.target_codes.iter().all(|c| c.trim().is_empty()) {
            return Err(IngestError::invalid_config(
                "filter.target_codes is empty",
                Some("List at least one taxonomy code, e.g. \"324500000X\""),
            ));
        }
        if self.filter.parallel_threads == Some(0) {
            return Err(IngestError::invalid_config(
                "filter.parallel_threads must be greater than 0",
                Some("Leave it unset to use all available processing units"),
            ));
        }
        if self.poller.page_size == 0 {
            return Err(IngestError::invalid_config("poller.page_size must be greater than 0", None));
        }
        if self.poller.page_size > MAX_API_PAGE_SIZE {
            return Err(IngestError::invalid_config(
                format!("poller.page_size must be at most {}", MAX_API_PAGE_SIZE),
                Some("The NPI Registry API rejects larger limits"),
            ));
        }
        if self.poller.max_requests_per_term == 0 {
            return Err(IngestError::invalid_config("poller.max_requests_per_term must be greater than 0", None));
        }
        if self.poller.retry_limit == 0 {
            return Err(IngestError::invalid_config(
                "poller.retry_limit must be at least 1",
                Some("The limit counts the first attempt"),
            ));
        }
        if self.orchestrator.batch_size == 0 {
            return Err(IngestError::invalid_config("orchestrator.batch_size must be greater than 0", None));
        }
        Ok(())
    }
}

/// Builder for customizing configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: IngestConfig,
}

impl ConfigBuilder {
    /// Start building a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.filter.chunk_size = size;
        self
    }

    /// Set number of filter workers
    pub fn parallel_threads(mut self, threads: Option<usize>) -> Self {
        self.config.filter.parallel_threads = threads;
        self
    }

    pub fn target_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.filter.target_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn progress_bar(mut self, enabled: bool) -> Self {
        self.config.filter.show_progress = enabled;
        self
    }

    pub fn query_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.poller.query_terms = terms.into_iter().map(Into::into).collect();
        self
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.poller.api_url = url.into();
        self
    }

    pub fn retry_limit(mut self, limit: usize) -> Self {
        self.config.poller.retry_limit = limit;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.orchestrator.batch_size = size;
        self
    }

    pub fn work_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.config.archive.work_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn build(self) -> crate::Result<IngestConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = IngestConfig::default();
        assert_eq!(config.filter.chunk_size, 100_000);
        assert_eq!(config.filter.target_codes, vec!["324500000X", "3245S0500X"]);
        assert_eq!(config.poller.page_size, 200);
        assert_eq!(config.poller.max_requests_per_term, 6);
        assert_eq!(config.poller.run_time_limit(), Duration::from_secs(14_400));
        assert_eq!(config.orchestrator.failure_delay(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .chunk_size(10)
            .parallel_threads(Some(2))
            .target_codes(["261QM0801X"])
            .build()
            .unwrap();

        assert_eq!(config.filter.chunk_size, 10);
        assert_eq!(config.filter.parallel_threads, Some(2));
        assert_eq!(config.filter.target_codes, vec!["261QM0801X"]);
    }

    #[test]
    fn test_validation_rejects_zero_sizes() {
        assert!(ConfigBuilder::new().chunk_size(0).build().is_err());
        assert!(ConfigBuilder::new().retry_limit(0).build().is_err());
        assert!(ConfigBuilder::new().batch_size(0).build().is_err());
        assert!(ConfigBuilder::new().target_codes(Vec::<String>::new()).build().is_err());
    }

    #[test]
    fn test_validation_rejects_unusable_poller_limits() {
        let mut config = IngestConfig::default();
        config.poller.max_requests_per_term = 0;
        assert!(matches!(config.validate(), Err(crate::IngestError::Configuration { .. })));

        let mut config = IngestConfig::default();
        config.poller.page_size = 201;
        assert!(matches!(config.validate(), Err(crate::IngestError::Configuration { .. })));

        config.poller.page_size = 200;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[poller]\npage_size = 50\n\n[filter]\nchunk_size = 7\n").unwrap();

        let config = IngestConfig::from_file(&path).unwrap();
        assert_eq!(config.poller.page_size, 50);
        assert_eq!(config.poller.max_skip, 1000);
        assert_eq!(config.filter.chunk_size, 7);

        let layered = IngestConfig::load(Some(&path)).unwrap();
        assert_eq!(layered.poller.page_size, 50);
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let config = ConfigBuilder::new().chunk_size(42).build().unwrap();
        config.save(&path).unwrap();
        assert_eq!(IngestConfig::from_file(&path).unwrap(), config);
    }
}
