use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ConfigInvalid,
    InvalidBackendType,
    AlreadyRunning,
    AlreadyRestarting,
    BackendNotRunning,
    LaunchFailed,
    Unimplemented,
    ProcessUnavailable,
    Unauthorized,
    Internal,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "urn:relay-node:error:config_invalid",
            Self::InvalidBackendType => "urn:relay-node:error:invalid_backend_type",
            Self::AlreadyRunning => "urn:relay-node:error:already_running",
            Self::AlreadyRestarting => "urn:relay-node:error:already_restarting",
            Self::BackendNotRunning => "urn:relay-node:error:backend_not_running",
            Self::LaunchFailed => "urn:relay-node:error:launch_failed",
            Self::Unimplemented => "urn:relay-node:error:unimplemented",
            Self::ProcessUnavailable => "urn:relay-node:error:process_unavailable",
            Self::Unauthorized => "urn:relay-node:error:unauthorized",
            Self::Internal => "urn:relay-node:error:internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "Config Invalid",
            Self::InvalidBackendType => "Invalid Backend Type",
            Self::AlreadyRunning => "Already Running",
            Self::AlreadyRestarting => "Already Restarting",
            Self::BackendNotRunning => "Backend Not Running",
            Self::LaunchFailed => "Launch Failed",
            Self::Unimplemented => "Unimplemented",
            Self::ProcessUnavailable => "Process Unavailable",
            Self::Unauthorized => "Unauthorized",
            Self::Internal => "Internal Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::ConfigInvalid => 400,
            Self::InvalidBackendType => 400,
            Self::AlreadyRunning => 409,
            Self::AlreadyRestarting => 409,
            Self::BackendNotRunning => 409,
            Self::LaunchFailed => 500,
            Self::Unimplemented => 501,
            Self::ProcessUnavailable => 503,
            Self::Unauthorized => 401,
            Self::Internal => 500,
        }
    }
}

/// RFC 7807 problem document returned by the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid config: {message}")]
    ConfigInvalid { message: String },
    #[error("invalid backend type: {backend}")]
    InvalidBackendType { backend: String },
    #[error("{core} is already running")]
    AlreadyRunning { core: String },
    #[error("{core} is already restarting")]
    AlreadyRestarting { core: String },
    #[error("backend is not running")]
    BackendNotRunning,
    #[error("failed to launch {core}: {message}")]
    LaunchFailed { core: String, message: String },
    #[error("{what} is not implemented for this backend")]
    Unimplemented { what: &'static str },
    #[error("process unavailable: {message}")]
    ProcessUnavailable { message: String },
    #[error("missing or invalid api key")]
    Unauthorized,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NodeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::ConfigInvalid { .. } | Self::Json(_) => ErrorType::ConfigInvalid,
            Self::InvalidBackendType { .. } => ErrorType::InvalidBackendType,
            Self::AlreadyRunning { .. } => ErrorType::AlreadyRunning,
            Self::AlreadyRestarting { .. } => ErrorType::AlreadyRestarting,
            Self::BackendNotRunning => ErrorType::BackendNotRunning,
            Self::LaunchFailed { .. } => ErrorType::LaunchFailed,
            Self::Unimplemented { .. } => ErrorType::Unimplemented,
            Self::ProcessUnavailable { .. } => ErrorType::ProcessUnavailable,
            Self::Unauthorized => ErrorType::Unauthorized,
            Self::Io(_) => ErrorType::Internal,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::InvalidBackendType { backend } => {
                extensions.insert("backend".to_string(), Value::String(backend.clone()));
            }
            Self::AlreadyRunning { core } | Self::AlreadyRestarting { core } => {
                extensions.insert("core".to_string(), Value::String(core.clone()));
            }
            Self::Unimplemented { what } => {
                extensions.insert("operation".to_string(), Value::String((*what).to_string()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<NodeError> for ProblemDetails {
    fn from(value: NodeError) -> Self {
        value.to_problem_details()
    }
}

impl From<&NodeError> for ProblemDetails {
    fn from(value: &NodeError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_classes_stay_distinguishable() {
        let conflict = NodeError::AlreadyRestarting {
            core: "sing-box".to_string(),
        };
        let unsupported = NodeError::Unimplemented {
            what: "traffic statistics",
        };
        assert_ne!(conflict.error_type(), unsupported.error_type());
        assert_eq!(conflict.error_type().status_code(), 409);
        assert_eq!(unsupported.error_type().status_code(), 501);
    }

    #[test]
    fn problem_details_carry_extensions() {
        let err = NodeError::InvalidBackendType {
            backend: "wireguard".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 400);
        assert_eq!(problem.type_, "urn:relay-node:error:invalid_backend_type");
        assert_eq!(
            problem.extensions.get("backend"),
            Some(&Value::String("wireguard".to_string()))
        );
    }
}
