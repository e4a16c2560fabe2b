//! Error types for strix

use thiserror::Error;

/// Result type for strix operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for strix
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to launch the browser process
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    /// The browser never announced its debugging endpoint in time
    #[error("Browser did not announce a DevTools endpoint within {0}ms")]
    LaunchTimeout(u64),

    /// No browser binary could be located
    #[error("Browser not found")]
    BrowserNotFound,

    /// The process object was disposed while the operation was pending
    #[error("Browser process has been disposed")]
    Disposed,

    /// Transport error (always terminal for the connection)
    #[error("Transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The reply to a protocol call carried an error payload
    #[error("Protocol error in {method}: {message} (code {code})")]
    Protocol {
        method: String,
        code: i64,
        message: String,
    },

    /// The connection closed while a call was outstanding
    #[error("Protocol call {method} failed: target closed ({reason})")]
    TargetClosed { method: String, reason: String },

    /// Navigation failed or was aborted
    #[error("Navigation failed: {0}")]
    Navigation(String),

    /// An operation ran past its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Frame lookup failed
    #[error("Frame not found: {0}")]
    FrameNotFound(String),

    /// A protocol invariant was violated; the shared maps can no longer be trusted
    #[error("Protocol invariant violated: {0}")]
    Invariant(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a transport error with context
    pub fn transport(context: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            source: None,
        }
    }

    /// Create a transport error with IO source
    pub fn transport_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Create a protocol error with full context
    pub fn protocol(method: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self::Protocol {
            method: method.into(),
            code,
            message: message.into(),
        }
    }

    /// Create a closed-target error tagged with the original method name
    pub fn target_closed(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TargetClosed {
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Create an invariant-violation error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    /// Whether this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::LaunchTimeout(_))
    }

    /// Whether this error means the target or process went away
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Error::TargetClosed { .. } | Error::Transport { .. } | Error::Disposed
        )
    }
}
