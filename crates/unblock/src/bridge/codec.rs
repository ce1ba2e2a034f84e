//! Slot payload encoding.
//!
//! Every slot payload is plain JSON via serde_json. The format is private to this
//! module; the only contract is that both sides of a call use it.

use serde::{Serialize, de::DeserializeOwned};

use super::protocol::RemoteError;

/// Last-resort error slot contents, used only if even the fallback cannot be encoded.
const UNENCODABLE_ERROR: &[u8] =
    br#"{"kind":"opaque","traceback":"worker error could not be encoded"}"#;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("callable `{0}` is not registered in this worker")]
    UnknownCallable(String),
}

pub fn encode<T: Serialize + ?Sized>(what: &'static str, value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|source| CodecError::Encode { what, source })
}

pub fn decode<T: DeserializeOwned>(what: &'static str, bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|source| CodecError::Decode { what, source })
}

pub fn to_value<T: Serialize + ?Sized>(
    what: &'static str,
    value: &T,
) -> Result<serde_json::Value, CodecError> {
    serde_json::to_value(value).map_err(|source| CodecError::Encode { what, source })
}

pub fn from_value<T: DeserializeOwned>(
    what: &'static str,
    value: serde_json::Value,
) -> Result<T, CodecError> {
    serde_json::from_value(value).map_err(|source| CodecError::Decode { what, source })
}

/// Capture a callable's error for the error slot.
///
/// Never fails: when the error value itself will not serialize, the result is a
/// [`RemoteError::Opaque`] whose text is the original traceback plus the reason the
/// error could not be carried across.
pub fn capture_error<E>(callable: &str, error: &E, traceback: String) -> RemoteError
where
    E: Serialize + std::fmt::Display + ?Sized,
{
    let type_name = std::any::type_name::<E>();
    match serde_json::to_value(error) {
        Ok(payload) => RemoteError::Raised {
            callable: callable.to_string(),
            type_name: type_name.to_string(),
            message: error.to_string(),
            payload,
            traceback,
        },
        Err(e) => {
            tracing::debug!(callable, type_name, error = %e, "Error value is not serializable");
            RemoteError::Opaque {
                traceback: format!(
                    "{traceback}\n\n{type_name} raised by `{callable}` could not be serialized: {e}"
                ),
            }
        }
    }
}

/// Encode an error slot payload. Never fails.
pub fn encode_error(error: &RemoteError) -> Vec<u8> {
    match serde_json::to_vec(error) {
        Ok(bytes) => bytes,
        Err(e) => {
            let fallback = RemoteError::Opaque {
                traceback: format!("{}\n\nerror payload could not be encoded: {e}", error.traceback()),
            };
            serde_json::to_vec(&fallback).unwrap_or_else(|_| UNENCODABLE_ERROR.to_vec())
        }
    }
}
