//! Error types shared by resolution, planning, and execution.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification for callers that branch on failure type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CyclicDependency,
    MaxDepthExceeded,
    ChecksumMismatch,
    Cancelled,
    UnsupportedPlanFormat,
    PlatformMismatch,
    UnknownAction,
    Recipe,
    VersionResolution,
    Download,
    Action,
    Io,
    Serialization,
    Config,
}

/// A downloaded artifact did not hash to the value recorded in the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub url: String,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for ChecksumMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "checksum mismatch for {}", self.url)?;
        writeln!(f, "  Expected: {}", self.expected)?;
        writeln!(f, "  Got:      {}", self.actual)?;
        writeln!(f)?;
        writeln!(
            f,
            "The upstream artifact changed after the plan was generated. This can be a"
        )?;
        writeln!(
            f,
            "legitimate re-release under the same version, or a tampered download."
        )?;
        writeln!(f, "Nothing was installed.")?;
        writeln!(f)?;
        write!(
            f,
            "If you trust the new artifact, regenerate the plan with: kura install <tool>@<version> --fresh"
        )
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("maximum dependency depth of {limit} exceeded: {}", path.join(" -> "))]
    MaxDepthExceeded { limit: usize, path: Vec<String> },

    #[error("{0}")]
    ChecksumMismatch(ChecksumMismatch),

    #[error("step {index} ({action}) failed: {source}")]
    StepFailed {
        index: usize,
        action: String,
        #[source]
        source: Box<Error>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported plan format version {found} (expected {expected})")]
    UnsupportedPlanFormat { found: u32, expected: u32 },

    #[error("plan targets {plan} but this host is {host}")]
    PlatformMismatch { plan: String, host: String },

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("recipe '{name}': {message}")]
    Recipe { name: String, message: String },

    #[error("cannot resolve version of {tool}: {message}")]
    VersionResolution { tool: String, message: String },

    #[error("download of {url} failed: {message}")]
    Download { url: String, message: String },

    #[error("{action}: {message}")]
    Action { action: String, message: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn recipe(name: &str, message: impl Into<String>) -> Self {
        Error::Recipe {
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn action(action: &str, message: impl Into<String>) -> Self {
        Error::Action {
            action: action.to_string(),
            message: message.into(),
        }
    }

    pub fn download(url: &str, message: impl Into<String>) -> Self {
        Error::Download {
            url: url.to_string(),
            message: message.into(),
        }
    }

    /// Kind of the underlying failure; step wrappers are looked through.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            Error::MaxDepthExceeded { .. } => ErrorKind::MaxDepthExceeded,
            Error::ChecksumMismatch(_) => ErrorKind::ChecksumMismatch,
            Error::StepFailed { source, .. } => source.kind(),
            Error::Cancelled => ErrorKind::Cancelled,
            Error::UnsupportedPlanFormat { .. } => ErrorKind::UnsupportedPlanFormat,
            Error::PlatformMismatch { .. } => ErrorKind::PlatformMismatch,
            Error::UnknownAction(_) => ErrorKind::UnknownAction,
            Error::Recipe { .. } => ErrorKind::Recipe,
            Error::VersionResolution { .. } => ErrorKind::VersionResolution,
            Error::Download { .. } => ErrorKind::Download,
            Error::Action { .. } => ErrorKind::Action,
            Error::Io { .. } => ErrorKind::Io,
            Error::Json(_) | Error::Toml(_) => ErrorKind::Serialization,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// The checksum mismatch details, if that is what failed.
    pub fn checksum_mismatch(&self) -> Option<&ChecksumMismatch> {
        match self {
            Error::ChecksumMismatch(m) => Some(m),
            Error::StepFailed { source, .. } => source.checksum_mismatch(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = Error::CyclicDependency {
            path: vec!["A".into(), "B".into(), "C".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency detected: A -> B -> C -> A");
        assert_eq!(err.kind(), ErrorKind::CyclicDependency);
    }

    #[test]
    fn test_kind_looks_through_step_wrapper() {
        let inner = Error::ChecksumMismatch(ChecksumMismatch {
            url: "https://example.com/a".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        });
        let err = Error::StepFailed {
            index: 1,
            action: "download".into(),
            source: Box::new(inner),
        };
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
        assert_eq!(err.checksum_mismatch().unwrap().actual, "bb");
        assert!(err.to_string().starts_with("step 1 (download) failed: "));
    }

    #[test]
    fn test_checksum_message_explains_recovery() {
        let m = ChecksumMismatch {
            url: "https://example.com/tool.tar.gz".into(),
            expected: "abc".into(),
            actual: "def".into(),
        };
        let text = m.to_string();
        assert!(text.contains("checksum mismatch for https://example.com/tool.tar.gz"));
        assert!(text.contains("Expected: abc"));
        assert!(text.contains("Got:      def"));
        assert!(text.contains("--fresh"));
    }
}
