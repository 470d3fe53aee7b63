//! Method dispatch table.
//!
//! A method is either immediate (runs to completion inside `execute`) or
//! deferred (returns a future the driver polls on the channel task).

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use crate::codec::{Fault, Reply};

pub mod builtin;

pub use builtin::{guest_methods, host_methods};

pub type ImmediateHandler = Arc<dyn Fn(Value) -> Reply + Send + Sync>;

#[async_trait]
pub trait DeferredMethod: Send + Sync {
    async fn call(&self, params: Value) -> Reply;
}

#[derive(Clone)]
pub enum Method {
    Immediate(ImmediateHandler),
    Deferred(Arc<dyn DeferredMethod>),
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Immediate(_) => f.write_str("Method::Immediate"),
            Method::Deferred(_) => f.write_str("Method::Deferred"),
        }
    }
}

/// Methods by name, in registration order.
#[derive(Clone, Default, Debug)]
pub struct MethodTable {
    methods: IndexMap<String, Method>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Reply + Send + Sync + 'static,
    {
        self.methods
            .insert(name.into(), Method::Immediate(Arc::new(handler)));
        self
    }

    pub fn register_deferred<M>(&mut self, name: impl Into<String>, method: M) -> &mut Self
    where
        M: DeferredMethod + 'static,
    {
        self.methods
            .insert(name.into(), Method::Deferred(Arc::new(method)));
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Pull a string parameter out of `params`.
///
/// Accepts `{"<key>": "..."}`, `["..."]` or a bare string.
pub(crate) fn string_param(params: &Value, key: &str) -> Result<String, Fault> {
    let as_string = |v: &Value| v.as_str().map(str::to_string);
    let found = match params {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(as_string),
        Value::Object(map) => map.get(key).and_then(as_string),
        _ => None,
    };
    found.ok_or_else(|| Fault::invalid_params(format!("missing string parameter '{key}'")))
}
