use strum::IntoStaticStr;
use thiserror::Error;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RetrieveError {
    #[error("no serving peer became eligible before the deadline")]
    NoPeers,
    #[error("deadline elapsed while serving peers were available")]
    Timeout,
    #[error("every tried peer returned data that failed validation")]
    Invalid,
    #[error("retrieval was cancelled")]
    Cancelled,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum OdrError {
    #[error("data is currently unavailable from serving peers ({0})")]
    Unavailable(RetrieveError),
    #[error("serving peers returned data that failed verification")]
    Invalid,
    #[error("query was cancelled")]
    Cancelled,
}

impl From<RetrieveError> for OdrError {
    fn from(error: RetrieveError) -> Self {
        match error {
            RetrieveError::NoPeers | RetrieveError::Timeout => Self::Unavailable(error),
            RetrieveError::Invalid => Self::Invalid,
            RetrieveError::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("payload failed validation: {0}")]
    Invalid(anyhow::Error),
    #[error("payload is valid but older than requested")]
    Stale,
}
