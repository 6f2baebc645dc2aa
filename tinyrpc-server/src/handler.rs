//! Method dispatch.
//!
//! The server resolves a `"Service.Method"` name through a [`MethodInvoker`]
//! and hands the decoded request body to the returned [`MethodHandler`].
//! [`ServiceTable`] is the bundled invoker: a table of typed async handlers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Future returned by a method handler.
pub type CallFuture = Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send>>;

/// Errors reported to the caller in the response header.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    #[error("rpc server: invalid argument: {0}")]
    InvalidArgument(#[source] serde_json::Error),

    #[error("rpc server: invalid reply: {0}")]
    InvalidReply(#[source] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

/// Invokes one method: decodes the argument, runs the call, encodes the reply.
pub trait MethodHandler: Send + Sync {
    fn call(&self, body: Value) -> CallFuture;
}

/// Resolves method names to handlers.
pub trait MethodInvoker: Send + Sync {
    fn lookup(&self, service_method: &str) -> Option<Arc<dyn MethodHandler>>;
}

/// Registration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("invalid method name {0:?}: expected \"Service.Method\"")]
    InvalidName(String),

    #[error("method already registered: {0}")]
    Duplicate(String),
}

type BoxedCall = Box<dyn Fn(Value) -> CallFuture + Send + Sync>;

struct FnHandler(BoxedCall);

impl MethodHandler for FnHandler {
    fn call(&self, body: Value) -> CallFuture {
        (self.0)(body)
    }
}

/// Table of typed handlers keyed by `"Service.Method"`.
#[derive(Default)]
pub struct ServiceTable {
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async function taking a typed argument and returning a typed reply.
    ///
    /// An `Err(message)` from the function is sent back as the response error.
    pub fn register<A, R, F, Fut>(&mut self, service_method: &str, f: F) -> Result<(), RegisterError>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        let call: BoxedCall = Box::new(move |body: Value| -> CallFuture {
            let arg = match serde_json::from_value::<A>(body) {
                Ok(arg) => arg,
                Err(e) => return Box::pin(async move { Err(CallError::InvalidArgument(e)) }),
            };
            let pending = f(arg);
            Box::pin(async move {
                let reply = pending.await.map_err(CallError::Failed)?;
                serde_json::to_value(reply).map_err(CallError::InvalidReply)
            })
        });
        self.register_handler(service_method, Arc::new(FnHandler(call)))
    }

    /// Registers a prebuilt handler.
    pub fn register_handler(
        &mut self,
        service_method: &str,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<(), RegisterError> {
        if !is_valid_method_name(service_method) {
            return Err(RegisterError::InvalidName(service_method.to_string()));
        }
        if self.methods.contains_key(service_method) {
            return Err(RegisterError::Duplicate(service_method.to_string()));
        }
        tracing::debug!("Registered method {}", service_method);
        self.methods.insert(service_method.to_string(), handler);
        Ok(())
    }

    /// Returns registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<_> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl MethodInvoker for ServiceTable {
    fn lookup(&self, service_method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.get(service_method).cloned()
    }
}

fn is_valid_method_name(name: &str) -> bool {
    match name.split_once('.') {
        Some((service, method)) => {
            !service.is_empty() && !method.is_empty() && !method.contains('.')
        }
        None => false,
    }
}
