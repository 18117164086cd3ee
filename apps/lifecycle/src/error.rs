use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("handler failure: {0}")]
    HandlerFailure(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::RecordNotFound(_) => "record_not_found",
            Self::StorageFailure(_) => "storage_failure",
            Self::HandlerFailure(_) => "handler_failure",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Conflict(_) => "conflict",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InsufficientBalance { .. } => self.to_string(),
            Self::RecordNotFound(message)
            | Self::StorageFailure(message)
            | Self::HandlerFailure(message)
            | Self::InvalidRequest(message)
            | Self::Conflict(message) => message.clone(),
        }
    }
}

pub fn map_store_error(error: StoreError) -> LifecycleError {
    match error {
        StoreError::Conflict(message) => LifecycleError::Conflict(message),
        StoreError::NotFound(message) => LifecycleError::RecordNotFound(message),
        StoreError::InsufficientBalance {
            available,
            requested,
        } => LifecycleError::InsufficientBalance {
            available,
            requested,
        },
        StoreError::Db(message) => LifecycleError::StorageFailure(message),
    }
}

pub(crate) fn required(field: &str, value: &str) -> Result<String, LifecycleError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LifecycleError::InvalidRequest(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}
