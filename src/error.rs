use serde_json::Value;
use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// A required field could not be resolved before network I/O.
    #[error("validation failed for `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("upstream rejected request: {message}")]
    UpstreamProtocol { message: String, details: Vec<Value> },

    #[error("upstream returned HTTP {status}: {body}")]
    UpstreamHttp { status: u16, body: String },

    /// Success response, but no heuristic located the expected identifier.
    #[error("could not extract {what} from response")]
    Extraction {
        what: String,
        snapshot_key: Option<String>,
    },

    #[error("image constraint not satisfied: {message}")]
    ImageConstraint {
        message: String,
        last_size: Option<usize>,
    },

    #[error("no recorded template for `{marketplace}`: {reason}")]
    TemplateNotFound { marketplace: String, reason: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("store failure: {0}")]
    Store(String),
}

impl AgentError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Validation { .. } => "validation",
            AgentError::UpstreamProtocol { .. } => "upstream_protocol",
            AgentError::UpstreamHttp { .. } => "upstream_http",
            AgentError::Extraction { .. } => "extraction",
            AgentError::ImageConstraint { .. } => "image_constraint",
            AgentError::TemplateNotFound { .. } => "template_not_found",
            AgentError::Transport(_) => "transport",
            AgentError::Store(_) => "store",
        }
    }
}

impl From<image::ImageError> for AgentError {
    fn from(source: image::ImageError) -> Self {
        AgentError::ImageConstraint {
            message: source.to_string(),
            last_size: None,
        }
    }
}

impl From<redis::RedisError> for AgentError {
    fn from(source: redis::RedisError) -> Self {
        AgentError::Store(source.to_string())
    }
}
