use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum WaystationError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] Status),
}

impl WaystationError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }
}

// redb reports each phase of a transaction with its own error type; fold them all into
// `redb::Error` so `?` works across begin/open/get/commit.
macro_rules! storage_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for WaystationError {
                fn from(e: $ty) -> Self {
                    Self::Storage(redb::Error::from(e))
                }
            }
        )*
    };
}

storage_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl From<WaystationError> for Status {
    fn from(e: WaystationError) -> Self {
        match e {
            WaystationError::NotFound(_) => Status::not_found(e.to_string()),
            WaystationError::FailedPrecondition(msg) => Status::failed_precondition(msg),
            WaystationError::Internal(_) | WaystationError::Encoding(_) => {
                Status::internal(e.to_string())
            }
            WaystationError::Aborted(_) | WaystationError::Storage(_) => {
                Status::aborted(e.to_string())
            }
            WaystationError::Cancelled => Status::cancelled(e.to_string()),
            WaystationError::Io(_) => Status::internal(e.to_string()),
            WaystationError::Transport(_) => Status::unavailable(e.to_string()),
            WaystationError::Rpc(status) => status,
        }
    }
}

pub type Result<T> = std::result::Result<T, WaystationError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn status_codes_follow_error_kind() {
        let cases = [
            (WaystationError::not_found("job \"a\""), Code::NotFound),
            (WaystationError::precondition("bad"), Code::FailedPrecondition),
            (WaystationError::Internal("x".into()), Code::Internal),
            (WaystationError::Aborted("x".into()), Code::Aborted),
            (WaystationError::Cancelled, Code::Cancelled),
        ];
        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn precondition_message_is_passed_through() {
        let status = Status::from(WaystationError::precondition("job is RUNNING"));
        assert_eq!(status.message(), "job is RUNNING");
    }
}
