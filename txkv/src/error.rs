use serde_derive::{Deserialize, Serialize};

/// A `Result` returning `Error`, used across the whole crate.
pub type CResult<T> = std::result::Result<T, Error>;

/// txkv errors. All except `Abort` are string-typed for simplicity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The transaction lost a conflict and was rolled back.
    /// The caller may retry it from scratch.
    Abort,
    /// An internal invariant or IO failure.
    Internal(String),
    /// Invalid data encountered while decoding a value or delta.
    Parse(String),
    /// An invalid argument from the caller, e.g. an oversized key.
    Value(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "transaction aborted"),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Value(msg) => write!(f, "value error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

/// A poisoned mutex means another thread panicked while holding the engine.
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(Error::Abort.to_string(), "transaction aborted");
        assert_eq!(Error::Value("key too long".to_string()).to_string(), "value error: key too long");
    }
}
