use crate::logging::LoggingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RbdVolError {
    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
