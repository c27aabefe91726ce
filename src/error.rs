use thiserror::Error;

/// Object-store failure. `NotFound` is kept apart so callers can treat a 404
/// as an answer instead of a fault.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store request failed for {key}: {message}")]
    Request { key: String, message: String },
}

impl RemoteError {
    pub fn request(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Request {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchiverError {
    #[error("local filesystem error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("cannot compare crawls from different sources: {left} vs {right}")]
    SourceMismatch { left: String, right: String },
    #[error("crawl {candidate} predates {incumbent}, the crawl it would replace")]
    FutureDataVersion { candidate: String, incumbent: String },
    #[error("retention policy reached an uncovered path: {0}")]
    PolicyViolation(String),
    #[error("config file invalid or unreadable: {0}")]
    InvalidConfig(String),
    #[error("another crawl-archiver process holds {0}")]
    AlreadyRunning(String),
}

impl ArchiverError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Programmer errors abort the whole run instead of a single crawl.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SourceMismatch { .. } | Self::FutureDataVersion { .. } | Self::PolicyViolation(_)
        )
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::E001Io,
            Self::Remote(_) => ErrorCode::E002Remote,
            Self::SourceMismatch { .. } => ErrorCode::E003SourceMismatch,
            Self::FutureDataVersion { .. } => ErrorCode::E004FutureDataVersion,
            Self::PolicyViolation(_) => ErrorCode::E005PolicyViolation,
            Self::InvalidConfig(_) => ErrorCode::E006ConfigInvalid,
            Self::AlreadyRunning(_) => ErrorCode::E007Locked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    E001Io,
    E002Remote,
    E003SourceMismatch,
    E004FutureDataVersion,
    E005PolicyViolation,
    E006ConfigInvalid,
    E007Locked,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001Io => "E001_IO",
            Self::E002Remote => "E002_REMOTE",
            Self::E003SourceMismatch => "E003_SOURCE_MISMATCH",
            Self::E004FutureDataVersion => "E004_FUTURE_DATA_VERSION",
            Self::E005PolicyViolation => "E005_POLICY_VIOLATION",
            Self::E006ConfigInvalid => "E006_CONFIG_INVALID",
            Self::E007Locked => "E007_LOCKED",
        }
    }
}

/// Finds the typed error inside an `anyhow` chain, if there is one.
pub fn classify(err: &anyhow::Error) -> Option<&ArchiverError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ArchiverError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn programmer_errors_are_fatal() {
        let err = ArchiverError::SourceMismatch {
            left: "a".into(),
            right: "b".into(),
        };
        assert!(err.is_fatal());
        assert!(!ArchiverError::Remote(RemoteError::NotFound("k".into())).is_fatal());
    }

    #[test]
    fn classify_sees_through_context() {
        let err: anyhow::Result<()> = Err(ArchiverError::PolicyViolation("x".into()))
            .context("while deciding");
        let err = err.unwrap_err();
        let typed = classify(&err).expect("typed error");
        assert_eq!(typed.code().as_str(), "E005_POLICY_VIOLATION");
    }
}
