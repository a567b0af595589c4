use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoEdge {
    Rising,
    Falling,
}

impl EchoEdge {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rising => "rising",
            Self::Falling => "falling",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("no {} echo edge within {timeout_us} us", edge.as_str())]
    EchoTimeout { edge: EchoEdge, timeout_us: u64 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {group} settings: {reason}")]
    Invalid { group: &'static str, reason: String },
    #[error("failed to persist settings: {0}")]
    Persistence(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(String),
    #[error("settings document format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Failure of a calibration capture requested through the control surface.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The closed set of broker failures the reporting loop is allowed to swallow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker rejected credentials: {0}")]
    Auth(String),
    #[error("broker session timed out after {0} ms")]
    Timeout(u64),
}

impl TelemetryError {
    /// Classifies a refused CONNECT by its CONNACK return code. Codes 4 (bad
    /// user name or password) and 5 (not authorized) are credential failures.
    pub fn refused(code: u8) -> Self {
        let detail = format!("connection refused, return code {code}");
        match code {
            4 | 5 => Self::Auth(detail),
            _ => Self::Connection(detail),
        }
    }
}
