//! Callables and the registry the worker dispatches on.
//!
//! A closure cannot cross a process boundary, so a callable is a serializable value
//! whose fields are its captured state. The worker binary registers every callable
//! type it can run; the orchestrator sends the registry name plus the encoded state.

use std::collections::HashMap;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::bridge::codec::{self, CodecError};
use crate::bridge::protocol::{CallablePayload, RemoteError};
use crate::worker::error_traceback;

/// A blocking, synchronous unit of work that can run in the worker process.
///
/// `Args` is the positional argument tuple, e.g. `(i64,)` or `()`.
pub trait Callable: Serialize + DeserializeOwned + Send + 'static {
    /// Registry key. Must be unique among the callables of one worker binary.
    const NAME: &'static str;

    type Args: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;
    type Error: std::error::Error + Serialize + DeserializeOwned + Send + 'static;

    fn call(self, args: Self::Args) -> Result<Self::Output, Self::Error>;
}

/// Plain message error for callables that have no richer error type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct CallError {
    pub message: String,
}

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for CallError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for CallError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

pub(crate) fn payload_of<C: Callable>(callable: &C) -> Result<CallablePayload, CodecError> {
    Ok(CallablePayload {
        name: C::NAME.to_string(),
        state: codec::to_value("callable", callable)?,
    })
}

/// A decoded call, ready to run. Yields the encoded return value.
pub(crate) type PreparedCall = Box<dyn FnOnce() -> Result<Vec<u8>, RemoteError>>;

trait Entry: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn prepare(&self, state: serde_json::Value, args: &[u8]) -> Result<PreparedCall, CodecError>;
}

struct TypedEntry<C>(PhantomData<fn() -> C>);

impl<C: Callable> Entry for TypedEntry<C> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<C>()
    }

    fn prepare(&self, state: serde_json::Value, args: &[u8]) -> Result<PreparedCall, CodecError> {
        let callable: C = codec::from_value("callable", state)?;
        let args: C::Args = codec::decode("arguments", args)?;

        Ok(Box::new(move || match callable.call(args) {
            Ok(output) => codec::encode("result", &output).map_err(|e| RemoteError::Codec {
                message: e.to_string(),
                traceback: error_traceback(&format!("encoding the result of `{}`", C::NAME), &e),
            }),
            Err(error) => {
                let traceback = error_traceback(&format!("callable `{}`", C::NAME), &error);
                Err(codec::capture_error(C::NAME, &error, traceback))
            }
        }))
    }
}

/// Callables this binary can run as a worker.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<&'static str, Box<dyn Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<C: Callable>(mut self) -> Self {
        self.register::<C>();
        self
    }

    /// Register `C` under `C::NAME`. Registering the same type twice is a no-op.
    ///
    /// # Panics
    ///
    /// If a different type is already registered under the same name.
    pub fn register<C: Callable>(&mut self) -> &mut Self {
        let entry = TypedEntry::<C>(PhantomData);
        if let Some(existing) = self.entries.get(C::NAME) {
            assert!(
                existing.type_name() == entry.type_name(),
                "callable name `{}` registered by both {} and {}",
                C::NAME,
                existing.type_name(),
                entry.type_name()
            );
            return self;
        }
        self.entries.insert(C::NAME, Box::new(entry));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn prepare(
        &self,
        payload: CallablePayload,
        args: &[u8],
    ) -> Result<PreparedCall, CodecError> {
        let entry = self
            .entries
            .get(payload.name.as_str())
            .ok_or_else(|| CodecError::UnknownCallable(payload.name.clone()))?;
        entry.prepare(payload.state, args)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("callables", &names).finish()
    }
}
