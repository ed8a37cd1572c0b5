//! Customized unified error type.

use std::fmt;
use std::io;

/// Customized error type for Keystone.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct KeystoneError(pub String);

impl fmt::Display for KeystoneError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `KeystoneError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for KeystoneError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                KeystoneError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(ctrlc::Error);

// Channel send errors lose their payload here; the message string is the
// same for every payload type.
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for KeystoneError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        KeystoneError(e.to_string())
    }
}
