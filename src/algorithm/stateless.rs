//! Stateless invocation adapter
//!
//! Turns a "start once, return a value" algorithm into a per-message handler
//! for stateless stream nodes. `start` registers the adapter as the input
//! listener and then waits until the session ends: an explicit `stop`/`exit`
//! returns `Ok(Value::Null)`, an error from any invocation is returned as
//! `Err` after it ends the session.

use std::sync::{Arc, Mutex, Weak};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::watch;

use super::{Algorithm, AlgorithmError};
use crate::broker::RemoteExecutionBroker;
use crate::core::context::TaskContext;
use crate::streaming::InboundMessage;

#[derive(Default)]
struct Session {
    options: Option<TaskContext>,
    last_error: Option<AlgorithmError>,
    stopped: bool,
}

pub struct StatelessAdapter {
    inner: Algorithm,
    active: watch::Sender<bool>,
    session: Mutex<Session>,
}

impl StatelessAdapter {
    pub fn new(inner: Algorithm) -> Arc<Self> {
        let (active, _) = watch::channel(false);
        Arc::new(Self {
            inner,
            active,
            session: Mutex::new(Session::default()),
        })
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        match self.session.lock() {
            Ok(mut session) => f(&mut session),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub async fn init(&self, options: TaskContext) -> Result<(), AlgorithmError> {
        self.inner.init(options.clone()).await?;
        self.with_session(|s| {
            s.options = Some(options);
            s.stopped = false;
        });
        Ok(())
    }

    pub async fn start(
        self: &Arc<Self>,
        options: TaskContext,
        broker: Arc<RemoteExecutionBroker>,
    ) -> Result<Value, AlgorithmError> {
        self.with_session(|s| {
            s.options.get_or_insert(options);
            s.last_error = None;
        });

        let adapter = Arc::downgrade(self);
        let weak_broker = Arc::downgrade(&broker);
        broker.register_input_listener(Arc::new(move |message: InboundMessage| {
            let adapter = Weak::clone(&adapter);
            let broker = Weak::clone(&weak_broker);
            async move {
                if let (Some(adapter), Some(broker)) = (adapter.upgrade(), broker.upgrade()) {
                    adapter.invoke(message, broker).await;
                }
            }
            .boxed()
        }));

        let mut inactive = self.active.subscribe();
        let activated = self.with_session(|s| {
            if !s.stopped {
                self.active.send_replace(true);
            }
            !s.stopped
        });
        if !activated {
            tracing::info!("session stopped before start, not listening");
            return Ok(Value::Null);
        }
        broker.start_message_listening();
        let _ = inactive.wait_for(|active| !*active).await;

        match self.with_session(|s| s.last_error.take()) {
            Some(error) => Err(error),
            None => Ok(Value::Null),
        }
    }

    /// Run the wrapped algorithm for one inbound message
    async fn invoke(&self, message: InboundMessage, broker: Arc<RemoteExecutionBroker>) {
        let Some(options) = self.with_session(|s| s.options.clone()) else {
            tracing::warn!("stream message before init, dropped");
            return;
        };
        let ctx = options.with_stream_input(message.payload, message.origin);
        let outcome = match self.inner.start(ctx, broker).await {
            Ok(result) if !options.childs.is_empty() => message
                .sender
                .send(result, None)
                .map_err(|e| AlgorithmError::new(e.to_string())),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(error) = outcome {
            tracing::error!(error = %error, "stateless invocation failed, ending session");
            self.with_session(|s| {
                s.last_error.get_or_insert(error);
            });
            self.active.send_replace(false);
        }
    }

    fn deactivate(&self) {
        self.with_session(|s| {
            s.stopped = true;
            self.active.send_replace(false);
        });
    }

    pub async fn stop(&self, data: Value) -> Result<(), AlgorithmError> {
        self.deactivate();
        self.inner.stop(data).await
    }

    pub async fn exit(&self, data: Value) -> Result<(), AlgorithmError> {
        self.deactivate();
        self.inner.exit(data).await
    }

    /// The adapter as a capability set
    pub fn into_algorithm(self: Arc<Self>) -> Algorithm {
        let init = Arc::clone(&self);
        let start = Arc::clone(&self);
        let stop = Arc::clone(&self);
        let exit = self;
        Algorithm {
            init: Some(Arc::new(move |ctx| {
                let adapter = Arc::clone(&init);
                async move { adapter.init(ctx).await }.boxed()
            })),
            start: Arc::new(move |ctx, broker| {
                let adapter = Arc::clone(&start);
                async move { adapter.start(ctx, broker).await }.boxed()
            }),
            stop: Some(Arc::new(move |data| {
                let adapter = Arc::clone(&stop);
                async move { adapter.stop(data).await }.boxed()
            })),
            exit: Some(Arc::new(move |data| {
                let adapter = Arc::clone(&exit);
                async move { adapter.exit(data).await }.boxed()
            })),
        }
    }
}
