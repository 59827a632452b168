//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every transport, protocol, and session failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The executable could not be launched (missing, not executable, ...).
    Spawn(String),
    /// Operation attempted on a closed session or an exited process.
    Closed(String),
    /// Writing to the subprocess stdin failed.
    TransportWrite(String),
    /// Undecoded output exceeded the frame buffer limit.
    BufferOverflow(String),
    /// A released frame was not valid JSON.
    Decode(String),
    /// The subprocess terminated while work was outstanding.
    UnexpectedExit(String),
    /// A control-protocol callback did not answer in time.
    ControlTimeout(String),
    /// Control-protocol request or callback failure.
    Control(String),
    /// Session usage error (double send, unknown subscriber, ...).
    Session(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Closed(msg) => write!(f, "closed: {msg}"),
            Self::TransportWrite(msg) => write!(f, "transport write: {msg}"),
            Self::BufferOverflow(msg) => write!(f, "buffer overflow: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
            Self::UnexpectedExit(msg) => write!(f, "unexpected exit: {msg}"),
            Self::ControlTimeout(msg) => write!(f, "control timeout: {msg}"),
            Self::Control(msg) => write!(f, "control: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Whether the session can keep running after this error.
    ///
    /// Overflow, decode, and control failures only affect a single frame or
    /// request; everything else ends the session.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BufferOverflow(_)
                | Self::Decode(_)
                | Self::ControlTimeout(_)
                | Self::Control(_)
                | Self::Session(_)
                | Self::NotFound(_)
        )
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
