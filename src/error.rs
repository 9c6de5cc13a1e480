/*!
 * Error handling for NPPES ingestion runs
 *
 * Fatal conditions abort a run and carry enough context to explain what went
 * wrong. Page-level API failures never reach this type: the poller contains
 * them (see [`crate::client::FetchError`]).
 */

use std::path::PathBuf;
use thiserror::Error;

/// Ingestion result type
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error types with context and suggestions
#[derive(Error, Debug)]
pub enum IngestError {
    /// File I/O errors with context
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
        context: ErrorContext,
    },

    /// Malformed row in the source file. Always fatal for the run.
    #[error("CSV parsing error at line {line:?}: {message}")]
    CsvParse {
        message: String,
        line: Option<usize>,
        context: ErrorContext,
    },

    /// None of the taxonomy code columns exist in the source header
    #[error("No taxonomy code columns found in {path}")]
    NoTaxonomyColumns {
        path: PathBuf,
        expected_base: String,
    },

    /// Zero or more than one archive entry matched the source file pattern
    #[error("Expected exactly one archive entry matching '{pattern}', found {}", matches.len())]
    ArchiveMatch {
        pattern: String,
        matches: Vec<String>,
    },

    /// A mapped record has no identifier and cannot be upserted
    #[error("Record at position {position} has no NPI number ({origin})")]
    MissingIdentifier {
        position: usize,
        origin: String,
    },

    /// Transport-level HTTP failure
    #[error("HTTP error: {message}")]
    Http {
        message: String,
        url: Option<String>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        suggestion: Option<String>,
    },

    /// Sink rejected or failed to apply a batch
    #[error("Sink error: {message}")]
    Sink {
        message: String,
        batch_len: usize,
    },

    /// Feature not enabled error
    #[error("Feature '{feature}' is not enabled")]
    FeatureNotEnabled {
        feature: String,
        enable_instruction: String,
    },

    /// Generic errors with custom message
    #[error("{message}")]
    Custom {
        message: String,
        suggestion: Option<String>,
    },
}

/// Error context providing additional information
#[derive(Debug, Default, Clone)]
pub struct ErrorContext {
    pub file_path: Option<PathBuf>,
    pub line_number: Option<usize>,
}

impl IngestError {
    /// Create an I/O error that remembers which file was involved
    pub fn io_at(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::Io {
            message: format!("{} ({})", source, path.display()),
            source,
            context: ErrorContext {
                file_path: Some(path),
                ..Default::default()
            },
        }
    }

    /// Attach the source file path to a CSV parse error
    pub fn with_file(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Self::CsvParse { message, line, mut context } => {
                context.file_path = Some(path.into());
                Self::CsvParse { message, line, context }
            }
            other => other,
        }
    }

    /// Create a feature not enabled error
    pub fn feature_required(feature: &str) -> Self {
        let enable_instruction = match feature {
            "download" => "Add 'nppes-ingest = { version = \"0.0\", features = [\"download\"] }' to your Cargo.toml",
            _ => "Enable the required feature in your Cargo.toml",
        };

        Self::FeatureNotEnabled {
            feature: feature.to_string(),
            enable_instruction: enable_instruction.to_string(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(message: impl Into<String>, suggestion: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            suggestion: suggestion.map(str::to_string),
        }
    }

    /// Whether this error aborts the run regardless of retries
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CsvParse { .. }
                | Self::NoTaxonomyColumns { .. }
                | Self::ArchiveMatch { .. }
                | Self::MissingIdentifier { .. }
                | Self::Configuration { .. }
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::NoTaxonomyColumns { expected_base, .. } => {
                format!(
                    "{}\n\nSuggestion: the file must contain columns named '{}_1' through '{}_15'",
                    self, expected_base, expected_base
                )
            }
            Self::ArchiveMatch { matches, .. } if !matches.is_empty() => {
                format!("{}\n\nCandidates: {}", self, matches.join(", "))
            }
            Self::FeatureNotEnabled { enable_instruction, .. } => {
                format!("{}\n\nTo enable: {}", self, enable_instruction)
            }
            Self::Configuration { suggestion: Some(sug), .. }
            | Self::Custom { suggestion: Some(sug), .. } => {
                format!("{}\n\nSuggestion: {}", self, sug)
            }
            _ => self.to_string(),
        }
    }
}

// Convenience conversions
impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
            context: ErrorContext::default(),
        }
    }
}

impl From<csv::Error> for IngestError {
    fn from(err: csv::Error) -> Self {
        let line = err.position().map(|pos| pos.line() as usize);

        Self::CsvParse {
            message: err.to_string(),
            line,
            context: ErrorContext {
                line_number: line,
                ..Default::default()
            },
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http {
            message: err.to_string(),
            url: err.url().map(|u| u.to_string()),
        }
    }
}

impl From<config::ConfigError> for IngestError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration {
            message: err.to_string(),
            suggestion: Some("Check the config file and NPPES_INGEST__* environment variables".to_string()),
        }
    }
}

#[cfg(feature = "download")]
impl From<zip::result::ZipError> for IngestError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Custom {
            message: format!("Failed to read ZIP archive: {}", err),
            suggestion: Some("Check if the file is a valid ZIP archive".to_string()),
        }
    }
}
