//! Error types for the acquisition pipeline with context and recovery information

use std::error::Error;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised anywhere between reading the identifier source and recording an outcome
#[derive(Error, Debug)]
pub enum HarvestError {
    /// Start of a numeric identifier range lies after its end
    #[error("Invalid identifier range: start {start} is greater than end {end}")]
    InvalidRange {
        start: u64,
        end: u64,
    },

    /// Identifier list file is missing
    #[error("Identifier list file not found: '{path}'")]
    SourceNotFound {
        path: PathBuf,
    },

    /// The platform has no content for this identifier
    #[error("No content found for '{identifier}'")]
    NotFound {
        identifier: String,
    },

    /// Credentials were rejected by the upstream API
    #[error("Authentication rejected by '{url}' (HTTP {status}); check cookie/uid/device_id")]
    Auth {
        url: String,
        status: u16,
    },

    /// Manifest could not be parsed or lacks a required representation
    #[error("Manifest parse failed for '{url}': {reason}")]
    ManifestParse {
        url: String,
        reason: String,
    },

    /// A transfer failed after exhausting its retry budget
    #[error("Transfer of '{url}' failed after {attempts} attempt(s): {last_error}")]
    Transfer {
        url: String,
        attempts: usize,
        last_error: String,
    },

    /// The external decryptor did not produce its output
    #[error("Decryption failed for '{identifier}': {reason}")]
    Decryption {
        identifier: String,
        reason: String,
    },

    /// HTTP transport errors with context
    #[error("HTTP request to '{url}' failed")]
    HttpRequest {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-success HTTP status that is not an auth or not-found condition
    #[error("HTTP {status} from '{url}'")]
    HttpStatus {
        url: String,
        status: u16,
    },

    /// Server answered a range request with the whole body
    #[error("Server ignored the byte-range request for '{url}'")]
    RangeIgnored {
        url: String,
    },

    /// Network timeout with retry suggestion
    #[error("Request to '{url}' timed out after {duration_secs}s (try increasing timeout or check network)")]
    NetworkTimeout {
        url: String,
        duration_secs: u64,
    },

    /// File system I/O errors with file context
    #[error("File operation failed on '{path}' while {operation}")]
    FileSystem {
        path: PathBuf,
        operation: FileOperation,
        #[source]
        source: std::io::Error,
    },

    /// Upstream returned a body we could not interpret
    #[error("Unexpected response from '{url}': {reason}")]
    UnexpectedResponse {
        url: String,
        reason: String,
    },

    /// Configuration errors
    #[error("Invalid configuration: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
        suggestion: Option<String>,
    },

    /// An external tool could not be started or exited unsuccessfully
    #[error("External tool '{tool}' failed: {reason}")]
    ExternalTool {
        tool: PathBuf,
        reason: String,
    },

    /// Work stopped by a run-level abort
    #[error("Cancelled: {reason}")]
    Cancelled {
        reason: String,
    },
}

/// Types of file operations for error context
#[derive(Debug, Clone, PartialEq)]
pub enum FileOperation {
    Read,
    Write,
    Create,
    Delete,
    Move,
    Metadata,
    CreateDir,
    Resize,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOperation::Read => write!(f, "reading"),
            FileOperation::Write => write!(f, "writing"),
            FileOperation::Create => write!(f, "creating"),
            FileOperation::Delete => write!(f, "deleting"),
            FileOperation::Move => write!(f, "moving"),
            FileOperation::Metadata => write!(f, "reading metadata"),
            FileOperation::CreateDir => write!(f, "creating directory"),
            FileOperation::Resize => write!(f, "resizing"),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    /// Check if error is transient and worth retrying
    pub fn is_recoverable(&self) -> bool {
        match self {
            HarvestError::HttpRequest { source, .. } => {
                if source.is_timeout() || source.is_connect() || source.is_body() || source.is_request() {
                    return true;
                }
                source.status().map_or(true, |status| status.is_server_error() || status == 429)
            }
            HarvestError::HttpStatus { status, .. } => *status >= 500 || *status == 429 || *status == 408 || *status == 416,
            HarvestError::NetworkTimeout { .. } => true,
            HarvestError::FileSystem { source, .. } => {
                matches!(source.kind(),
                    std::io::ErrorKind::Interrupted |
                    std::io::ErrorKind::TimedOut |
                    std::io::ErrorKind::WouldBlock
                )
            }
            HarvestError::InvalidRange { .. } => false,
            HarvestError::SourceNotFound { .. } => false,
            HarvestError::NotFound { .. } => false,
            HarvestError::Auth { .. } => false,
            HarvestError::ManifestParse { .. } => false,
            HarvestError::Transfer { .. } => false, // Already exhausted retries
            HarvestError::Decryption { .. } => false,
            HarvestError::RangeIgnored { .. } => false,
            HarvestError::UnexpectedResponse { .. } => false,
            HarvestError::Configuration { .. } => false,
            HarvestError::ExternalTool { .. } => false,
            HarvestError::Cancelled { .. } => false,
        }
    }

    /// Setup-time errors abort the run before any worker starts
    pub fn is_setup_error(&self) -> bool {
        matches!(self,
            HarvestError::InvalidRange { .. } |
            HarvestError::SourceNotFound { .. } |
            HarvestError::Configuration { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HarvestError::Cancelled { .. })
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            HarvestError::InvalidRange { .. } => "invalid_range",
            HarvestError::SourceNotFound { .. } => "source_not_found",
            HarvestError::NotFound { .. } => "not_found",
            HarvestError::Auth { .. } => "auth",
            HarvestError::ManifestParse { .. } => "manifest_parse",
            HarvestError::Transfer { .. } => "transfer",
            HarvestError::Decryption { .. } => "decryption",
            HarvestError::HttpRequest { .. } => "http_request",
            HarvestError::HttpStatus { .. } => "http_status",
            HarvestError::RangeIgnored { .. } => "range_ignored",
            HarvestError::NetworkTimeout { .. } => "network_timeout",
            HarvestError::FileSystem { .. } => "file_system",
            HarvestError::UnexpectedResponse { .. } => "unexpected_response",
            HarvestError::Configuration { .. } => "configuration",
            HarvestError::ExternalTool { .. } => "external_tool",
            HarvestError::Cancelled { .. } => "cancelled",
        }
    }

    /// Get severity level for error prioritization
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            HarvestError::InvalidRange { .. } => ErrorSeverity::Critical,
            HarvestError::SourceNotFound { .. } => ErrorSeverity::Critical,
            HarvestError::Configuration { .. } => ErrorSeverity::Critical,
            HarvestError::Auth { .. } => ErrorSeverity::High,
            HarvestError::NotFound { .. } => ErrorSeverity::Medium,
            HarvestError::ManifestParse { .. } => ErrorSeverity::High,
            HarvestError::Transfer { .. } => ErrorSeverity::High,
            HarvestError::Decryption { .. } => ErrorSeverity::High,
            HarvestError::HttpRequest { .. } => ErrorSeverity::Medium,
            HarvestError::HttpStatus { .. } => ErrorSeverity::Medium,
            HarvestError::RangeIgnored { .. } => ErrorSeverity::Low,
            HarvestError::NetworkTimeout { .. } => ErrorSeverity::Medium,
            HarvestError::FileSystem { .. } => ErrorSeverity::High,
            HarvestError::UnexpectedResponse { .. } => ErrorSeverity::Medium,
            HarvestError::ExternalTool { .. } => ErrorSeverity::High,
            HarvestError::Cancelled { .. } => ErrorSeverity::Low,
        }
    }

    /// Get user-friendly suggestion for resolving the error
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            HarvestError::NetworkTimeout { .. } => {
                Some("Check your internet connection or proxy, or increase timeout_secs")
            }
            HarvestError::Auth { .. } => Some("Refresh the credentials in the config file"),
            HarvestError::Configuration { suggestion, .. } => suggestion.as_deref(),
            HarvestError::Transfer { .. } => Some("Re-run later; the partial file will be resumed"),
            _ => None,
        }
    }

    /// Create a detailed error report for debugging
    pub fn detailed_report(&self) -> String {
        let mut report = format!("Error: {}\n", self);
        report.push_str(&format!("Category: {}\n", self.category()));
        report.push_str(&format!("Severity: {:?}\n", self.severity()));
        report.push_str(&format!("Recoverable: {}\n", self.is_recoverable()));

        if let Some(suggestion) = self.suggestion() {
            report.push_str(&format!("Suggestion: {}\n", suggestion));
        }

        if let Some(source) = self.source() {
            report.push_str(&format!("Root cause: {}\n", source));
        }

        report
    }

    /// Build the error matching an unsuccessful HTTP status
    pub fn from_status(url: &str, status: reqwest::StatusCode, identifier: Option<&str>) -> Self {
        match status.as_u16() {
            401 | 403 => HarvestError::Auth {
                url: url.to_string(),
                status: status.as_u16(),
            },
            404 => match identifier {
                Some(identifier) => HarvestError::NotFound {
                    identifier: identifier.to_string(),
                },
                None => HarvestError::HttpStatus {
                    url: url.to_string(),
                    status: 404,
                },
            },
            code => HarvestError::HttpStatus {
                url: url.to_string(),
                status: code,
            },
        }
    }

    /// Wrap a reqwest error, keeping timeouts distinct
    pub fn from_reqwest(url: &str, error: reqwest::Error, timeout_secs: u64) -> Self {
        if error.is_timeout() {
            HarvestError::NetworkTimeout {
                url: url.to_string(),
                duration_secs: timeout_secs,
            }
        } else {
            HarvestError::HttpRequest {
                url: url.to_string(),
                source: error,
            }
        }
    }

    pub fn file_system<P: Into<PathBuf>>(path: P, operation: FileOperation, source: std::io::Error) -> Self {
        HarvestError::FileSystem {
            path: path.into(),
            operation,
            source,
        }
    }
}

/// Error severity levels for prioritization
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let auth = HarvestError::from_status("https://api.example.com", reqwest::StatusCode::FORBIDDEN, Some("ABF-249"));
        assert!(matches!(auth, HarvestError::Auth { status: 403, .. }));
        assert!(!auth.is_recoverable());

        let missing = HarvestError::from_status("https://api.example.com", reqwest::StatusCode::NOT_FOUND, Some("5950"));
        assert!(matches!(missing, HarvestError::NotFound { ref identifier } if identifier == "5950"));
        assert!(!missing.is_recoverable());

        let busy = HarvestError::from_status("https://cdn.example.com", reqwest::StatusCode::SERVICE_UNAVAILABLE, None);
        assert!(busy.is_recoverable());

        let limited = HarvestError::from_status("https://cdn.example.com", reqwest::StatusCode::TOO_MANY_REQUESTS, None);
        assert!(limited.is_recoverable());
    }

    #[test]
    fn test_setup_errors() {
        assert!(HarvestError::InvalidRange { start: 5, end: 1 }.is_setup_error());
        assert!(HarvestError::SourceNotFound { path: PathBuf::from("ids.txt") }.is_setup_error());
        assert!(!HarvestError::NotFound { identifier: "x".into() }.is_setup_error());
    }

    #[test]
    fn test_detailed_report_mentions_category() {
        let err = HarvestError::NetworkTimeout { url: "https://cdn.example.com/a.mp4".into(), duration_secs: 30 };
        let report = err.detailed_report();
        assert!(report.contains("network_timeout"));
        assert!(report.contains("Recoverable: true"));
    }
}
