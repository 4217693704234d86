use std::fmt;

/// Mirrors the teacher's `RunFailedWithSummary`: a structured, telemetry-ready
/// failure carrying a stable code and a JSON summary alongside the message.
#[derive(Debug, Clone)]
pub struct SyncFailedWithContext {
    pub code: &'static str,
    pub message: String,
    pub context: serde_json::Value,
}

impl SyncFailedWithContext {
    pub fn new(code: &'static str, message: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            context,
        }
    }
}

impl fmt::Display for SyncFailedWithContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SyncFailedWithContext {}

#[derive(Debug, Clone)]
pub enum ConfigError {
    Missing {
        mapping: String,
        available: Vec<String>,
    },
    MissingField {
        mapping: String,
        field: &'static str,
    },
    UnsupportedSourceType {
        mapping: String,
        found: String,
    },
    Invalid {
        mapping: String,
        message: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing { mapping, available } => write!(
                f,
                "mapping config not found: {mapping} (available: {})",
                available.join(", ")
            ),
            ConfigError::MissingField { mapping, field } => {
                write!(f, "mapping {mapping} is missing required field {field}")
            }
            ConfigError::UnsupportedSourceType { mapping, found } => {
                write!(f, "mapping {mapping} has unsupported source type {found}")
            }
            ConfigError::Invalid { mapping, message } => {
                write!(f, "mapping {mapping} has invalid config: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct ConnError(pub String);

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source connection failed: {}", self.0)
    }
}
impl std::error::Error for ConnError {}

#[derive(Debug, Clone)]
pub struct ExtractError {
    pub message: String,
    pub sanitised_sql: Option<String>,
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "extract failed: {}", self.message)
    }
}
impl std::error::Error for ExtractError {}

#[derive(Debug, Clone)]
pub struct WriteError(pub String);

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "jsonl write failed: {}", self.0)
    }
}
impl std::error::Error for WriteError {}

#[derive(Debug, Clone)]
pub struct TokenError(pub String);

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload token error: {}", self.0)
    }
}
impl std::error::Error for TokenError {}

#[derive(Debug, Clone)]
pub struct UploadError(pub String);

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload failed: {}", self.0)
    }
}
impl std::error::Error for UploadError {}

#[derive(Debug, Clone)]
pub struct DeleteError(pub String);

impl fmt::Display for DeleteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "post-upload delete failed: {}", self.0)
    }
}
impl std::error::Error for DeleteError {}

#[derive(Debug, Clone)]
pub struct WatermarkError(pub String);

impl fmt::Display for WatermarkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watermark advance failed: {}", self.0)
    }
}
impl std::error::Error for WatermarkError {}

#[derive(Debug, Clone)]
pub struct AlreadyRunning(pub String);

impl fmt::Display for AlreadyRunning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mapping {} is already running", self.0)
    }
}
impl std::error::Error for AlreadyRunning {}

#[derive(Debug, Clone)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run was canceled")
    }
}
impl std::error::Error for Canceled {}

/// Unified taxonomy for the runner's failure path; each variant downcasts to its
/// own concrete error type the same way the teacher's worker loop downcasts
/// `RunFailedWithSummary`.
#[derive(Debug)]
pub enum SyncError {
    Config(ConfigError),
    Conn(ConnError),
    Extract(ExtractError),
    Write(WriteError),
    Token(TokenError),
    Upload(UploadError),
    Delete(DeleteError),
    Watermark(WatermarkError),
    AlreadyRunning(AlreadyRunning),
    Canceled(Canceled),
    Other(anyhow::Error),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Config(e) => write!(f, "{e}"),
            SyncError::Conn(e) => write!(f, "{e}"),
            SyncError::Extract(e) => write!(f, "{e}"),
            SyncError::Write(e) => write!(f, "{e}"),
            SyncError::Token(e) => write!(f, "{e}"),
            SyncError::Upload(e) => write!(f, "{e}"),
            SyncError::Delete(e) => write!(f, "{e}"),
            SyncError::Watermark(e) => write!(f, "{e}"),
            SyncError::AlreadyRunning(e) => write!(f, "{e}"),
            SyncError::Canceled(e) => write!(f, "{e}"),
            SyncError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl SyncError {
    /// Stable telemetry code, mirroring the §7 error taxonomy names verbatim.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Config(_) => "ConfigError",
            SyncError::Conn(_) => "ConnError",
            SyncError::Extract(_) => "ExtractError",
            SyncError::Write(_) => "WriteError",
            SyncError::Token(_) => "TokenError",
            SyncError::Upload(_) => "UploadError",
            SyncError::Delete(_) => "DeleteError",
            SyncError::Watermark(_) => "WatermarkError",
            SyncError::AlreadyRunning(_) => "AlreadyRunning",
            SyncError::Canceled(_) => "Canceled",
            SyncError::Other(_) => "Unknown",
        }
    }

    /// Delete/watermark failures are logged but never fail the run (§4.1 steps 5/6).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::Delete(_) | SyncError::Watermark(_))
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(value: anyhow::Error) -> Self {
        SyncError::Other(value)
    }
}
