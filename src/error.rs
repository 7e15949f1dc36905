use chrono::NaiveDateTime;
use thiserror::Error;

/// Failures talking to a statistics backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("statistics backend unavailable: {0}")]
    Unavailable(String),
    #[error("statistics backend rejected `{command}`: {message}")]
    Rejected { command: String, message: String },
    #[error("malformed statistics row: {0}")]
    Malformed(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures talking to the meter data provider
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("provider returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected provider payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Reasons a reconciliation pass refuses to write anything
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("inconsistent data for {stream} at {at}: {reason}")]
    Inconsistent {
        stream: String,
        at: NaiveDateTime,
        reason: String,
    },
    /// Raw provider data that no rebuild could turn into valid statistics
    #[error("invalid source data for {stream} at {at}: {reason}")]
    InvalidInput {
        stream: String,
        at: NaiveDateTime,
        reason: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    pub fn is_inconsistent(&self) -> bool {
        matches!(self, ReconcileError::Inconsistent { .. })
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FormulaError {
    #[error("unexpected character '{0}' at {1}")]
    UnexpectedChar(char, usize),
    #[error("unexpected end of formula")]
    UnexpectedEnd,
    #[error("unexpected token `{0}`")]
    UnexpectedToken(String),
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
}

/// User-facing configuration errors, keyed like form errors
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid_cups")]
    InvalidCups,
    #[error("invalid_credentials")]
    InvalidCredentials,
    #[error("already_configured")]
    AlreadyConfigured,
    #[error("invalid_formula: {0}")]
    InvalidFormula(#[from] FormulaError),
    #[error(transparent)]
    Provider(ProviderError),
}

impl SetupError {
    /// Key shown next to the form that produced the error
    pub fn form_key(&self) -> &'static str {
        match self {
            SetupError::InvalidCups => "invalid_cups",
            SetupError::InvalidCredentials => "invalid_credentials",
            SetupError::AlreadyConfigured => "already_configured",
            SetupError::InvalidFormula(_) => "invalid_formula",
            SetupError::Provider(_) => "cannot_connect",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no meters configured")]
    NoMeters,
}
