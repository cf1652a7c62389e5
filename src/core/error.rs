use thiserror::Error;

/// Failures surfaced by the rate engines.
///
/// Missing table data is not an error: lookups return `Option` and partial
/// simulations leave the final balance unset. `InsufficientHistory` is only
/// raised when a caller asks for a computation that cannot start at all.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SwrError {
    #[error("insufficient history: {0}")]
    InsufficientHistory(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("numeric domain error: {0}")]
    NumericDomain(String),

    #[error("allocation {0}% stock is not present in the market series")]
    UnsupportedAllocation(u32),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("market data error: {0}")]
    Data(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SwrError {
    fn from(value: std::io::Error) -> Self {
        SwrError::Io(value.to_string())
    }
}

pub type SwrResult<T> = Result<T, SwrError>;

/// Bail out with an `InvariantViolation` unless `cond` holds.
///
/// Unlike `debug_assert!`, this check is present in release builds.
macro_rules! ensure_invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($crate::core::error::SwrError::InvariantViolation(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_invariant;
