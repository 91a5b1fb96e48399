mod pool;

pub use pool::{ApiErrorBody, ApiErrorObject, SorapoolError};

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}
