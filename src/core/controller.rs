//! Task lifecycle controller
//!
//! Receives lifecycle commands from the worker, drives the bound algorithm
//! through them and reports progress back. Owns the broker, the streaming
//! manager, the data adapter and the peer cache for the life of the process.
//!
//! `initialize` is handled inline by the dispatcher; every other command runs
//! on its own task so a long running `start` never blocks `stop` or `exit`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::context::{ExitOptions, StopOptions, TaskContext};
use super::error::{ErrorReport, RunnerError};
use super::shutdown::ShutdownManager;
use super::state::TaskState;
use crate::algorithm::{Algorithm, LoadError, StatelessAdapter};
use crate::broker::RemoteExecutionBroker;
use crate::cache::PeerDataCache;
use crate::observability::task_span;
use crate::storage::{codec, DataAdapter};
use crate::streaming::StreamingManager;
use crate::transport::{IncomingCommand, IncomingMessage, OutgoingCommand, OutgoingMessage, WorkerChannel};

/// Upper bound on waiting for in-flight peer replies during `exit`
const EXIT_SERVING_DRAIN: Duration = Duration::from_secs(5);

/// Timers used by the controller
#[derive(Debug, Clone)]
pub struct ControllerTimings {
    pub stopping_heartbeat: Duration,
    pub serving_report: Duration,
}

impl Default for ControllerTimings {
    fn default() -> Self {
        Self {
            stopping_heartbeat: Duration::from_secs(1),
            serving_report: Duration::from_secs(5),
        }
    }
}

/// Everything the controller owns; assembled by `RunnerBuilder`
pub struct ControllerParts {
    pub channel: Arc<dyn WorkerChannel>,
    pub algorithm: Result<Algorithm, LoadError>,
    pub broker: Arc<RemoteExecutionBroker>,
    pub streaming: Arc<StreamingManager>,
    /// Present in indirect storage mode
    pub data: Option<Arc<DataAdapter>>,
    pub cache: Option<Arc<PeerDataCache>>,
    pub shutdown: Arc<ShutdownManager>,
    pub timings: ControllerTimings,
}

pub struct TaskController {
    channel: Arc<dyn WorkerChannel>,
    algorithm: Result<Algorithm, LoadError>,
    binding: RwLock<Option<Algorithm>>,
    context: RwLock<Option<TaskContext>>,
    state: Mutex<TaskState>,
    broker: Arc<RemoteExecutionBroker>,
    streaming: Arc<StreamingManager>,
    data: Option<Arc<DataAdapter>>,
    cache: Option<Arc<PeerDataCache>>,
    shutdown: Arc<ShutdownManager>,
    timings: ControllerTimings,
    stopping: AtomicBool,
    start_span: Mutex<Option<tracing::Span>>,
}

/// Holds the `start` span for the duration of one `start` call
struct StartSpanGuard<'a> {
    controller: &'a TaskController,
}

impl<'a> StartSpanGuard<'a> {
    fn enter(controller: &'a TaskController, span: &tracing::Span) -> Self {
        if let Ok(mut current) = controller.start_span.lock() {
            *current = Some(span.clone());
        }
        if let Some(cache) = &controller.cache {
            cache.set_parent_span(Some(span.clone()));
        }
        Self { controller }
    }
}

impl Drop for StartSpanGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut current) = self.controller.start_span.lock() {
            *current = None;
        }
        if let Some(cache) = &self.controller.cache {
            cache.set_parent_span(None);
        }
    }
}

impl TaskController {
    pub fn new(parts: ControllerParts) -> Arc<Self> {
        if let Err(e) = &parts.algorithm {
            tracing::error!("{}", e);
        }
        Arc::new(Self {
            channel: parts.channel,
            algorithm: parts.algorithm,
            binding: RwLock::new(None),
            context: RwLock::new(None),
            state: Mutex::new(TaskState::default()),
            broker: parts.broker,
            streaming: parts.streaming,
            data: parts.data,
            cache: parts.cache,
            shutdown: parts.shutdown,
            timings: parts.timings,
            stopping: AtomicBool::new(false),
            start_span: Mutex::new(None),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Context of the last `initialize`, with resolved input once started
    pub fn context(&self) -> Option<TaskContext> {
        self.context.read().ok().and_then(|c| c.clone())
    }

    /// Broker handed to the algorithm's `start`
    pub fn broker(&self) -> &Arc<RemoteExecutionBroker> {
        &self.broker
    }

    /// Peer cache, present in indirect mode with discovery enabled
    pub fn cache(&self) -> Option<&Arc<PeerDataCache>> {
        self.cache.as_ref()
    }

    /// Shutdown manager the controller requests exit through
    pub fn shutdown(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    /// Span of the running `start`, if any
    pub fn current_start_span(&self) -> Option<tracing::Span> {
        self.start_span.lock().ok().and_then(|s| s.clone())
    }

    fn transition(&self, next: TaskState) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.can_transition(next) {
            tracing::debug!("state {} -> {}", *state, next);
            *state = next;
        } else {
            tracing::debug!("ignoring transition {} -> {}", *state, next);
        }
    }

    fn send(&self, message: OutgoingMessage) {
        let command = message.command;
        if let Err(e) = self.channel.send(message) {
            tracing::error!(command = command.as_str(), error = %e, "failed to send to worker");
        }
    }

    fn send_command(&self, command: OutgoingCommand) {
        self.send(OutgoingMessage::new(command));
    }

    fn report(&self, error: RunnerError) {
        tracing::error!(error = %error, "reporting error to worker");
        self.send(OutgoingMessage::error(ErrorReport::from(&error)));
    }

    /// Parse and dispatch one frame from the worker
    pub async fn handle_message(self: &Arc<Self>, message: IncomingMessage) {
        match message.parse() {
            Ok(command) => self.dispatch(command).await,
            Err(e) => self.report(e),
        }
    }

    pub async fn dispatch(self: &Arc<Self>, command: IncomingCommand) {
        match command {
            IncomingCommand::Initialize(ctx) => self.initialize(*ctx).await,
            IncomingCommand::Start => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.start().await });
            }
            IncomingCommand::Stop(options) => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.stop(options).await });
            }
            IncomingCommand::Exit(options) => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.exit(options).await });
            }
            IncomingCommand::ExecutionDone(completion) => {
                let broker = Arc::clone(&self.broker);
                tokio::spawn(async move { broker.on_execution_done(completion).await });
            }
            IncomingCommand::SubPipelineDone(completion) => {
                let broker = Arc::clone(&self.broker);
                tokio::spawn(async move { broker.on_sub_pipeline_done(completion).await });
            }
            IncomingCommand::StreamingInMessage(message) => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let send_message_id = message.send_message_id.clone();
                    if let Err(e) = this.streaming.on_message(message).await {
                        tracing::warn!(error = %e, "stream message not delivered");
                    }
                    this.send(OutgoingMessage::with_data(
                        OutgoingCommand::StreamingInMessageDone,
                        json!({ "sendMessageId": send_message_id }),
                    ));
                });
            }
            IncomingCommand::Unknown(command) => {
                tracing::debug!(command = %command, "ignoring unsupported command");
            }
        }
    }

    pub async fn initialize(&self, ctx: TaskContext) {
        let algorithm = match &self.algorithm {
            Ok(algorithm) => algorithm.clone(),
            Err(e) => return self.report(e.clone().into()),
        };
        tracing::info!(job_id = %ctx.job_id, task_id = %ctx.task_id, "initializing task");

        let binding = if ctx.is_stateless_stream() {
            StatelessAdapter::new(algorithm).into_algorithm()
        } else {
            algorithm
        };
        self.broker.set_job_id(&ctx.job_id);
        if let Ok(mut current) = self.context.write() {
            *current = Some(ctx.clone());
        }
        if let Ok(mut current) = self.binding.write() {
            *current = Some(binding.clone());
        }

        match binding.init(ctx).await {
            Ok(()) => {
                self.transition(TaskState::Initialized);
                self.send_command(OutgoingCommand::Initialized);
            }
            Err(e) => self.report(e.into()),
        }
    }

    fn bound(&self) -> Result<(TaskContext, Algorithm), RunnerError> {
        if let Err(e) = &self.algorithm {
            return Err(e.clone().into());
        }
        let ctx = self.context().ok_or(RunnerError::NotInitialized)?;
        let binding = self
            .binding
            .read()
            .ok()
            .and_then(|b| b.clone())
            .ok_or(RunnerError::NotInitialized)?;
        Ok((ctx, binding))
    }

    pub async fn start(&self) {
        let (ctx, algorithm) = match self.bound() {
            Ok(bound) => bound,
            Err(e) => return self.report(e),
        };
        let span = task_span("start", &ctx.job_id, &ctx.task_id);
        let _guard = StartSpanGuard::enter(self, &span);

        let result = self.run_start(ctx, algorithm).instrument(span).await;
        if let Err(e) = result {
            self.report(e);
        }
    }

    async fn run_start(&self, mut ctx: TaskContext, algorithm: Algorithm) -> Result<(), RunnerError> {
        self.transition(TaskState::Started);
        self.send_command(OutgoingCommand::Started);

        if let Some(data) = &self.data {
            ctx.input = data.resolve_input(&ctx).await?;
            if let Ok(mut current) = self.context.write() {
                if let Some(stored) = current.as_mut() {
                    stored.input = ctx.input.clone();
                }
            }
        }

        let result = algorithm.start(ctx.clone(), Arc::clone(&self.broker)).await?;
        tracing::info!("algorithm finished");
        self.handle_response(&ctx, result).await
    }

    /// Inline mode sends the result in `done`; indirect mode stores it and
    /// reports its placement in `storing` first.
    ///
    /// When the peer cache accepts the result, `storing` goes out before the
    /// write so peers can fetch it right away. A missing, closed or unused
    /// cache falls back to storage only: write first, then `storing`.
    async fn handle_response(&self, ctx: &TaskContext, result: Value) -> Result<(), RunnerError> {
        let Some(data) = &self.data else {
            self.send(OutgoingMessage::with_data(OutgoingCommand::Done, result));
            self.transition(TaskState::Done);
            return Ok(());
        };

        let encoded = codec::encode(&result)?;
        let placement = DataAdapter::create_storage_info(ctx, &result, &encoded);

        let in_cache = match &self.cache {
            Some(cache) if !ctx.info.save_paths.is_empty() => cache.set_sending_state(
                &ctx.task_id,
                encoded.payload.clone(),
                encoded.size(),
                encoded.header.clone(),
            ),
            _ => false,
        };

        let mut storing = json!({
            "taskId": ctx.task_id,
            "storageInfo": placement.storage_info,
            "metadata": placement.metadata,
        });
        if in_cache {
            if let Some(cache) = &self.cache {
                storing["discovery"] = json!(cache.discovery());
            }
            self.send(OutgoingMessage::with_data(OutgoingCommand::Storing, storing));
            data.set_data(&ctx.job_id, &ctx.task_id, &encoded).await?;
        } else {
            data.set_data(&ctx.job_id, &ctx.task_id, &encoded).await?;
            self.send(OutgoingMessage::with_data(OutgoingCommand::Storing, storing));
        }

        if ctx.is_stream() {
            self.streaming.stop_streaming(false).await;
        }
        self.send_command(OutgoingCommand::Done);
        self.transition(TaskState::Done);
        Ok(())
    }

    pub async fn stop(&self, options: StopOptions) {
        if self
            .stopping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("Got stop command while already stopping");
            return;
        }

        let ctx = self.context();
        let span = match &ctx {
            Some(ctx) => task_span("stop", &ctx.job_id, &ctx.task_id),
            None => task_span("stop", "", ""),
        };
        let result = self.run_stop(ctx, options).instrument(span).await;
        if let Err(e) = result {
            self.report(e);
        }
        self.stopping.store(false, Ordering::SeqCst);
    }

    async fn run_stop(&self, ctx: Option<TaskContext>, options: StopOptions) -> Result<(), RunnerError> {
        self.transition(TaskState::Stopping);
        let binding = self.binding.read().ok().and_then(|b| b.clone());
        if let Some(algorithm) = binding {
            let data = serde_json::to_value(&options).unwrap_or(Value::Null);
            algorithm.stop(data).await?;
        }

        if ctx.as_ref().map(TaskContext::is_stream).unwrap_or(false) {
            if options.force_stop {
                tracing::info!("forcing stop");
                self.streaming.stop_streaming(true).await;
            } else {
                tracing::info!("entering stopping soon");
                let heartbeat = CancellationToken::new();
                let beats = self.spawn_stopping_heartbeat(heartbeat.clone());
                self.streaming.stop_streaming(false).await;
                heartbeat.cancel();
                if let Err(e) = beats.await {
                    tracing::warn!(error = %e, "stopping heartbeat task failed");
                }
            }
        }

        self.send_command(OutgoingCommand::Stopped);
        self.transition(TaskState::Stopped);
        Ok(())
    }

    fn spawn_stopping_heartbeat(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let channel = Arc::clone(&self.channel);
        let period = self.timings.stopping_heartbeat;
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {
                        if let Err(e) = channel.send(OutgoingMessage::new(OutgoingCommand::Stopping)) {
                            tracing::warn!(error = %e, "stopping heartbeat not sent");
                        }
                    }
                }
            }
        })
    }

    /// Runs the exit hook, releases the peer cache and requests process exit
    /// with the given code, even when the hook fails.
    pub async fn exit(&self, options: ExitOptions) {
        let code = options.exit_code.unwrap_or(0);
        let binding = self
            .binding
            .read()
            .ok()
            .and_then(|b| b.clone())
            .or_else(|| self.algorithm.as_ref().ok().cloned());

        if let Some(algorithm) = binding {
            let data = serde_json::to_value(&options).unwrap_or(Value::Null);
            if let Err(e) = algorithm.exit(data).await {
                self.report(e.into());
            }
        }

        self.close_cache().await;
        self.transition(TaskState::Exited);
        tracing::info!("got exit command. Exiting with code {}", code);
        self.shutdown.request_exit(code);
    }

    /// Close the peer cache once in-flight replies are written
    pub async fn close_cache(&self) {
        if let Some(cache) = &self.cache {
            if tokio::time::timeout(EXIT_SERVING_DRAIN, cache.wait_till_serving_is_done())
                .await
                .is_err()
            {
                tracing::warn!("peer replies still in flight, closing cache anyway");
            }
            cache.close();
        }
    }

    /// Periodically tell the worker that this process is serving a result
    pub fn spawn_serving_reporter(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let cache = Arc::clone(self.cache.as_ref()?);
        let channel = Arc::clone(&self.channel);
        let token = self.shutdown.token();
        let period = self.timings.serving_report;
        Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {
                        if !cache.is_serving() {
                            continue;
                        }
                        let status = OutgoingMessage::with_data(OutgoingCommand::ServingStatus, json!(true));
                        if let Err(e) = channel.send(status) {
                            tracing::warn!(error = %e, "serving status not sent");
                        }
                    }
                }
            }
        }))
    }
}
