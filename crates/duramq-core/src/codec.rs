//! Callable encode/decode and the HMAC-guarded closure variant.
//!
//! A dynamically-typed queue can hand a worker an arbitrary closure,
//! serialize it, and `eval` it back on the other side. Rust has no
//! equivalent: a closure's code cannot be serialized and reconstructed in
//! another process. `Closure` here is instead a **named handler**
//! registered ahead of time, with any captured state carried as a JSON
//! payload and tamper-checked with an HMAC tag computed at enqueue time.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Context;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::QueueError;
use crate::model::CallableType;

type HmacSha256 = Hmac<Sha256>;

/// The decoded form of a job's `callable_type` + `callable` + `params`
/// columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Callable {
    /// A free function, looked up by name in the `CallableRegistry`.
    Function { name: String },
    /// `Type::method`, static dispatch, looked up by `(type_name, method)`.
    StaticMethod { type_name: String, method: String },
    /// An instance method against a preloaded object, deserialized from
    /// `object_instance` before dispatch.
    InstanceMethod { type_name: String, method: String },
    /// A registered handler plus its captured state, tamper-checked by
    /// `hmac` before it is trusted.
    Closure {
        handler_name: String,
        captured: serde_json::Value,
        hmac: Vec<u8>,
    },
}

/// Serialize a `Callable` to the bytes stored in the job's `callable`
/// column. `Closure` payloads are HMAC-signed here at enqueue time.
pub fn encode_callable(callable: &Callable, key: &[u8]) -> anyhow::Result<Vec<u8>> {
    let callable = match callable {
        Callable::Closure {
            handler_name,
            captured,
            ..
        } => {
            let hmac = sign_closure(handler_name, captured, key)?;
            Callable::Closure {
                handler_name: handler_name.clone(),
                captured: captured.clone(),
                hmac,
            }
        }
        other => other.clone(),
    };
    serde_json::to_vec(&callable).context("encoding callable")
}

/// Deserialize a job's `callable` column back into a `Callable`, verifying
/// the HMAC tag on `Closure` payloads against `key`. A tampered closure is
/// always a terminal error regardless of remaining retry budget.
pub fn decode_callable(bytes: &[u8], key: &[u8], job_id: uuid::Uuid) -> Result<Callable, QueueError> {
    let callable: Callable = serde_json::from_slice(bytes)
        .map_err(|e| QueueError::InvalidCallable(e.to_string()))?;

    if let Callable::Closure {
        handler_name,
        captured,
        hmac,
    } = &callable
    {
        verify_closure(handler_name, captured, hmac, key)
            .map_err(|_| QueueError::TamperedClosure { job_id })?;
    }

    Ok(callable)
}

/// Which `CallableType` tag a `Callable` maps back to for storage.
pub fn callable_type_of(callable: &Callable) -> CallableType {
    match callable {
        Callable::Function { .. } => CallableType::Function,
        Callable::StaticMethod { .. } | Callable::InstanceMethod { .. } => CallableType::ClassMethod,
        Callable::Closure { .. } => CallableType::Closure,
    }
}

fn sign_closure(handler_name: &str, captured: &serde_json::Value, key: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).context("hmac key of invalid length")?;
    mac.update(handler_name.as_bytes());
    mac.update(captured.to_string().as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_closure(
    handler_name: &str,
    captured: &serde_json::Value,
    tag: &[u8],
    key: &[u8],
) -> anyhow::Result<()> {
    let mut mac = HmacSha256::new_from_slice(key).context("hmac key of invalid length")?;
    mac.update(handler_name.as_bytes());
    mac.update(captured.to_string().as_bytes());
    mac.verify_slice(tag).context("hmac verification failed")
}

/// A closure handler: takes its captured JSON state, returns success or a
/// failure message.
pub type ClosureHandler = Box<dyn Fn(serde_json::Value) -> anyhow::Result<()> + Send + Sync>;

/// Process-wide table of named closure handlers and plain functions.
///
/// Stands in for the dynamic `eval` the original queue relies on: a worker
/// process registers every callable it may be asked to run at startup, and
/// dispatch only ever resolves by name.
#[derive(Default)]
pub struct CallableRegistry {
    functions: RwLock<HashMap<String, Box<dyn Fn(serde_json::Value) -> anyhow::Result<()> + Send + Sync>>>,
    closures: RwLock<HashMap<String, ClosureHandler>>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(serde_json::Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.functions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), Box::new(f));
    }

    pub fn register_closure<F>(&self, handler_name: impl Into<String>, f: F)
    where
        F: Fn(serde_json::Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.closures
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handler_name.into(), Box::new(f));
    }

    /// Resolve and invoke a decoded `Callable` against `params`.
    pub fn invoke(&self, callable: &Callable, params: serde_json::Value) -> anyhow::Result<()> {
        match callable {
            Callable::Function { name } => {
                let table = self.functions.read().unwrap_or_else(|e| e.into_inner());
                let f = table
                    .get(name)
                    .with_context(|| format!("no function registered as {name:?}"))?;
                f(params)
            }
            Callable::StaticMethod { type_name, method } | Callable::InstanceMethod { type_name, method } => {
                let key = format!("{type_name}::{method}");
                let table = self.functions.read().unwrap_or_else(|e| e.into_inner());
                let f = table
                    .get(&key)
                    .with_context(|| format!("no method registered as {key:?}"))?;
                f(params)
            }
            Callable::Closure { handler_name, captured, .. } => {
                let table = self.closures.read().unwrap_or_else(|e| e.into_inner());
                let f = table
                    .get(handler_name)
                    .with_context(|| format!("no closure handler registered as {handler_name:?}"))?;
                f(captured.clone())
            }
        }
    }
}
