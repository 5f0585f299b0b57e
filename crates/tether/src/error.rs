use std::fmt;

use crate::ids::EpochId;

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// An exception raised inside the interpreter, as reported across the boundary.
///
/// Carries the interpreter's exception type name and optional message so the host
/// can match on the type without parsing text.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NativeError {
    exc_type: String,
    message: Option<String>,
}

impl NativeError {
    /// Creates a native error with the given exception type and message.
    pub fn new(exc_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exc_type: exc_type.into(),
            message: Some(message.into()),
        }
    }

    /// Creates a native error that has an exception type but no message.
    pub fn bare(exc_type: impl Into<String>) -> Self {
        Self {
            exc_type: exc_type.into(),
            message: None,
        }
    }

    /// The interpreter's exception type name (e.g. `ValueError`).
    #[must_use]
    pub fn exc_type(&self) -> &str {
        &self.exc_type
    }

    /// The exception message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.exc_type),
            None => f.write_str(&self.exc_type),
        }
    }
}

impl std::error::Error for NativeError {}

/// Why an operation was refused because of session or handle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidState {
    /// No interpreter is running in this session.
    NoActiveSession,
    /// The handle was minted under an epoch that is no longer live.
    DeadEpoch(EpochId),
    /// The session that owned the handle has been dropped.
    SessionDropped,
    /// The handle's refcount unit was already released.
    Released,
    /// The calling thread already holds the session's native lock.
    Reentrant,
    /// A builtin or helper name is missing from the session's lookup tables.
    MissingHelper {
        /// Which table was consulted (`builtins` or `helpers`).
        table: &'static str,
        /// The name that was looked up.
        name: String,
    },
}

impl fmt::Display for InvalidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoActiveSession => f.write_str("no active interpreter session"),
            Self::DeadEpoch(epoch) => write!(f, "handle belongs to dead {epoch}"),
            Self::SessionDropped => f.write_str("owning session was dropped"),
            Self::Released => f.write_str("handle was already released"),
            Self::Reentrant => f.write_str("re-entrant native call on a thread already inside the interpreter"),
            Self::MissingHelper { table, name } => write!(f, "'{name}' is not registered in {table}"),
        }
    }
}

/// Errors surfaced by handle, marshaling and attribute operations.
///
/// Every failure that originates on the native side is converted into one of
/// these variants at the call boundary; nothing native escapes unconverted.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// The session or handle is not in a state that allows the operation.
    InvalidState(InvalidState),
    /// A handle was used with a session other than the one that minted it.
    StateMismatch(String),
    /// A result that had to be an interpreter object was something else.
    NotAnObject(String),
    /// A host value cannot be marshaled into an interpreter argument.
    UnsupportedArgumentType(String),
    /// The interpreter raised (or crashed) while executing the call.
    NativeFault(NativeError),
}

impl BridgeError {
    /// Returns true if this is an `InvalidState` error of any flavor.
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState(state) => write!(f, "invalid state: {state}"),
            Self::StateMismatch(msg) => write!(f, "invalid state (not match): {msg}"),
            Self::NotAnObject(msg) => write!(f, "not an interpreter object: {msg}"),
            Self::UnsupportedArgumentType(msg) => write!(f, "unsupported argument type: {msg}"),
            Self::NativeFault(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NativeFault(error) => Some(error),
            _ => None,
        }
    }
}

impl From<InvalidState> for BridgeError {
    fn from(state: InvalidState) -> Self {
        Self::InvalidState(state)
    }
}

impl From<NativeError> for BridgeError {
    fn from(error: NativeError) -> Self {
        Self::NativeFault(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_error_display_includes_type_and_message() {
        let error = NativeError::new("ValueError", "boom");
        assert_eq!(error.to_string(), "ValueError: boom");
        assert_eq!(NativeError::bare("StopIteration").to_string(), "StopIteration");
    }

    #[test]
    fn native_fault_displays_interpreter_text() {
        let error = BridgeError::from(NativeError::new("KeyError", "'k'"));
        assert_eq!(error.to_string(), "KeyError: 'k'");
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn invalid_state_flavors_render() {
        let error = BridgeError::from(InvalidState::DeadEpoch(EpochId::new(4)));
        assert!(error.is_invalid_state());
        assert_eq!(error.to_string(), "invalid state: handle belongs to dead epoch 4");

        let missing = InvalidState::MissingHelper {
            table: "helpers",
            name: "unbox".to_owned(),
        };
        assert_eq!(missing.to_string(), "'unbox' is not registered in helpers");
    }
}
