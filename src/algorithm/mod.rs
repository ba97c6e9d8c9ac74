//! User algorithm capability set
//!
//! An algorithm is a set of optional callbacks (`init`, `stop`, `exit`)
//! around a mandatory `start`. Callbacks are collected with
//! `AlgorithmCallbacks` and checked once by `bind`; the controller only ever
//! sees a bound `Algorithm`.

pub mod registry;
pub mod stateless;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use thiserror::Error;

pub use registry::AlgorithmRegistry;
pub use stateless::StatelessAdapter;

use crate::broker::{BrokerError, RemoteExecutionBroker};
use crate::core::context::TaskContext;

/// Algorithm that cannot be loaded; fatal for every lifecycle command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("unable to find mandatory method {0}")]
    MissingMethod(&'static str),

    #[error("unable to find algorithm {0}")]
    UnknownAlgorithm(String),
}

/// Error raised by the algorithm's own code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AlgorithmError {
    pub message: String,
    pub details: Option<String>,
}

impl AlgorithmError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

impl From<&str> for AlgorithmError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for AlgorithmError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for AlgorithmError {
    fn from(error: anyhow::Error) -> Self {
        let chain: Vec<String> = error.chain().skip(1).map(|c| c.to_string()).collect();
        Self {
            message: error.to_string(),
            details: (!chain.is_empty()).then(|| chain.join(": ")),
        }
    }
}

impl From<BrokerError> for AlgorithmError {
    fn from(error: BrokerError) -> Self {
        Self::new(error.to_string())
    }
}

pub type InitFn = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<(), AlgorithmError>> + Send + Sync>;
pub type StartFn = Arc<
    dyn Fn(TaskContext, Arc<RemoteExecutionBroker>) -> BoxFuture<'static, Result<Value, AlgorithmError>>
        + Send
        + Sync,
>;
pub type HookFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), AlgorithmError>> + Send + Sync>;

/// Callbacks as supplied by the user, before validation
#[derive(Clone, Default)]
pub struct AlgorithmCallbacks {
    init: Option<InitFn>,
    start: Option<StartFn>,
    stop: Option<HookFn>,
    exit: Option<HookFn>,
}

impl AlgorithmCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AlgorithmError>> + Send + 'static,
    {
        self.init = Some(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    pub fn start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TaskContext, Arc<RemoteExecutionBroker>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, AlgorithmError>> + Send + 'static,
    {
        self.start = Some(Arc::new(move |ctx, broker| f(ctx, broker).boxed()));
        self
    }

    pub fn stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AlgorithmError>> + Send + 'static,
    {
        self.stop = Some(Arc::new(move |data| f(data).boxed()));
        self
    }

    pub fn exit<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AlgorithmError>> + Send + 'static,
    {
        self.exit = Some(Arc::new(move |data| f(data).boxed()));
        self
    }

    /// Validate the capability set
    pub fn bind(self) -> Result<Algorithm, LoadError> {
        for (name, found) in [
            ("init", self.init.is_some()),
            ("stop", self.stop.is_some()),
            ("exit", self.exit.is_some()),
        ] {
            if found {
                tracing::info!("found method {}", name);
            } else {
                tracing::info!("unable to find optional method {}", name);
            }
        }
        let start = self.start.ok_or(LoadError::MissingMethod("start"))?;
        tracing::info!("found method start");
        Ok(Algorithm {
            init: self.init,
            start,
            stop: self.stop,
            exit: self.exit,
        })
    }
}

/// A validated capability set
#[derive(Clone)]
pub struct Algorithm {
    init: Option<InitFn>,
    start: StartFn,
    stop: Option<HookFn>,
    exit: Option<HookFn>,
}

impl Algorithm {
    pub fn has_init(&self) -> bool {
        self.init.is_some()
    }

    pub fn has_stop(&self) -> bool {
        self.stop.is_some()
    }

    pub fn has_exit(&self) -> bool {
        self.exit.is_some()
    }

    pub async fn init(&self, ctx: TaskContext) -> Result<(), AlgorithmError> {
        match &self.init {
            Some(init) => guarded("init", async { init(ctx).await }).await,
            None => Ok(()),
        }
    }

    pub async fn start(&self, ctx: TaskContext, broker: Arc<RemoteExecutionBroker>) -> Result<Value, AlgorithmError> {
        guarded("start", async { (self.start)(ctx, broker).await }).await
    }

    pub async fn stop(&self, data: Value) -> Result<(), AlgorithmError> {
        match &self.stop {
            Some(stop) => guarded("stop", async { stop(data).await }).await,
            None => Ok(()),
        }
    }

    pub async fn exit(&self, data: Value) -> Result<(), AlgorithmError> {
        match &self.exit {
            Some(exit) => guarded("exit", async { exit(data).await }).await,
            None => Ok(()),
        }
    }
}

/// Run a user hook, turning a panic into an `AlgorithmError`
async fn guarded<T>(
    hook: &'static str,
    call: impl Future<Output = Result<T, AlgorithmError>>,
) -> Result<T, AlgorithmError> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(hook, "algorithm panicked: {}", message);
            Err(AlgorithmError::with_details(message, format!("panic in {}", hook)))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "algorithm panicked".to_string()
    }
}
