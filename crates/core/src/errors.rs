use std::fmt;

use squill_kv::KvError;

/// Status codes of the public API. Every error carries one; `Row` and
/// `Done` are the two non-error step outcomes and never appear inside an
/// [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Success,
    Error,
    Internal,
    Perm,
    Abort,
    Busy,
    Locked,
    NoMem,
    ReadOnly,
    Interrupted,
    IoErr,
    NotFound,
    Full,
    CantOpen,
    Protocol,
    Empty,
    Schema,
    Constraint,
    Mismatch,
    Misuse,
    Auth,
    Format,
    Range,
    Corrupt,
    RunRecovery,
    InvalidName,
    Row,
    Done,
}

impl ErrorCode {
    const ALL: [ErrorCode; 28] = [
        ErrorCode::Success,
        ErrorCode::Error,
        ErrorCode::Internal,
        ErrorCode::Perm,
        ErrorCode::Abort,
        ErrorCode::Busy,
        ErrorCode::Locked,
        ErrorCode::NoMem,
        ErrorCode::ReadOnly,
        ErrorCode::Interrupted,
        ErrorCode::IoErr,
        ErrorCode::NotFound,
        ErrorCode::Full,
        ErrorCode::CantOpen,
        ErrorCode::Protocol,
        ErrorCode::Empty,
        ErrorCode::Schema,
        ErrorCode::Constraint,
        ErrorCode::Mismatch,
        ErrorCode::Misuse,
        ErrorCode::Auth,
        ErrorCode::Format,
        ErrorCode::Range,
        ErrorCode::Corrupt,
        ErrorCode::RunRecovery,
        ErrorCode::InvalidName,
        ErrorCode::Row,
        ErrorCode::Done,
    ];

    /// Recover a code from its numeric form (as carried in Halt's `p1`).
    pub fn from_code(code: i32) -> ErrorCode {
        Self::ALL
            .into_iter()
            .find(|c| *c as i32 == code)
            .unwrap_or(ErrorCode::Internal)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(<&'static str>::from(self))
    }
}

/// An engine error: a status code plus an owned, caller-visible message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Error {
        Error {
            code,
            message: message.into(),
        }
    }

    /// Generic SQL error whose detail lives in the message.
    pub fn sql(message: impl Into<String>) -> Error {
        Error::new(ErrorCode::Error, message)
    }

    pub fn misuse(message: impl Into<String>) -> Error {
        Error::new(ErrorCode::Misuse, message)
    }

    pub fn constraint(message: impl Into<String>) -> Error {
        Error::new(ErrorCode::Constraint, message)
    }

    pub fn internal(message: impl Into<String>) -> Error {
        Error::new(ErrorCode::Internal, message)
    }
}

impl From<KvError> for Error {
    fn from(err: KvError) -> Error {
        let code = match &err {
            KvError::Busy => ErrorCode::Busy,
            KvError::CantOpen(_) => ErrorCode::CantOpen,
            KvError::ReadOnly => ErrorCode::ReadOnly,
            KvError::Corrupt(_) => ErrorCode::Corrupt,
            KvError::Io(_) => ErrorCode::IoErr,
            KvError::NoSuchContainer(_)
            | KvError::NotPositioned
            | KvError::NoTransaction => ErrorCode::Internal,
        };
        Error::new(code, err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new(ErrorCode::IoErr, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_like_the_abi_names() {
        assert_eq!(ErrorCode::CantOpen.to_string(), "CANT_OPEN");
        assert_eq!(ErrorCode::Busy.to_string(), "BUSY");
        assert_eq!(ErrorCode::RunRecovery.to_string(), "RUN_RECOVERY");
    }

    #[test]
    fn kv_busy_maps_to_busy() {
        let err: Error = KvError::Busy.into();
        assert_eq!(err.code, ErrorCode::Busy);
    }
}
