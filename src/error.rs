use crate::policy::PolicyVersion;

#[derive(thiserror::Error, Debug)]
pub enum PortalError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("order '{order_id}' moved on from '{expected}' before this action committed")]
    StaleState { order_id: String, expected: String },
    #[error("policy version mismatch: client used {client}, server runs {server}")]
    PolicyVersionMismatch {
        client: PolicyVersion,
        server: PolicyVersion,
    },
    #[error("cannot hard delete {kind} '{id}': {reason}")]
    DependentDeleteFailure {
        kind: &'static str,
        id: String,
        reason: String,
    },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("record encoding failure: {0}")]
    Codec(String),
}

impl PortalError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        PortalError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Expected, user-facing outcomes. Everything else is an infrastructure
    /// failure that the caller should retry.
    pub fn is_domain(&self) -> bool {
        !matches!(self, PortalError::Storage(_) | PortalError::Codec(_))
    }
}

impl From<sled::transaction::TransactionError<PortalError>> for PortalError {
    fn from(value: sled::transaction::TransactionError<PortalError>) -> Self {
        match value {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => PortalError::Storage(e),
        }
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for PortalError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        PortalError::Codec(value.to_string())
    }
}

impl From<minicbor::decode::Error> for PortalError {
    fn from(value: minicbor::decode::Error) -> Self {
        PortalError::Codec(value.to_string())
    }
}

pub type Result<T, E = PortalError> = std::result::Result<T, E>;
