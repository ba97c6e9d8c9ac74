//! Process entry points
//!
//! `run` wires the worker socket to a `TaskController` and drives it until the
//! worker asks the process to exit, the channel closes for good, or a signal
//! arrives. The exit code is returned to the caller, which owns the process.

use std::sync::Arc;
use std::time::Duration;

use crate::algorithm::{Algorithm, AlgorithmCallbacks, AlgorithmRegistry, LoadError};
use crate::config::{load_config, DebugOptions, RunnerConfig};
use crate::core::{RunnerBuilder, ShutdownManager, ShutdownReason};
use crate::observability;
use crate::transport::{SocketEvent, WorkerSocket};

/// How long queued worker messages may take to drain before exit
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the algorithm against the worker configured by `config/algorunner.toml`
/// and `ALGORUNNER__*` variables
pub async fn run(callbacks: AlgorithmCallbacks) -> anyhow::Result<i32> {
    observability::init();
    let config = load_config(None)?;
    run_with_config(config, callbacks.bind()).await
}

/// Run the algorithm registered under `algorithm.entry_point`
pub async fn run_from_registry(registry: &AlgorithmRegistry) -> anyhow::Result<i32> {
    observability::init();
    let config = load_config(None)?;
    let algorithm = registry.resolve(&config.algorithm.entry_point);
    run_with_config(config, algorithm).await
}

/// Connect to a debug worker at `url`; results are always sent inline
pub async fn debug(url: &str, callbacks: AlgorithmCallbacks) -> anyhow::Result<i32> {
    debug_with(DebugOptions::url(url), callbacks).await
}

/// Like `debug`, but the target may also be given as cluster address plus
/// algorithm name
pub async fn debug_with(options: DebugOptions, callbacks: AlgorithmCallbacks) -> anyhow::Result<i32> {
    let url = options.worker_url()?;
    observability::init();
    let config = load_config(None)?.for_debug(url);
    run_with_config(config, callbacks.bind()).await
}

/// A load error does not abort the process: it is reported to the worker on
/// every lifecycle command instead.
pub async fn run_with_config(config: RunnerConfig, algorithm: Result<Algorithm, LoadError>) -> anyhow::Result<i32> {
    let url = WorkerSocket::create_url(&config.socket, config.effective_storage_mode());
    let (socket, mut events) = WorkerSocket::connect(
        url,
        config.socket.reconnect_interval(),
        config.socket.max_payload,
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let controller = RunnerBuilder::new(config, socket.clone())
        .with_algorithm(algorithm)
        .with_shutdown(Arc::clone(&shutdown))
        .build()
        .await?;
    let _reporter = controller.spawn_serving_reporter();

    let reason = loop {
        tokio::select! {
            reason = shutdown.wait_for_shutdown() => break reason,
            event = events.recv() => match event {
                Some(SocketEvent::Connected) => tracing::info!("connected to worker {}", socket.url()),
                Some(SocketEvent::Message(message)) => controller.handle_message(message).await,
                Some(SocketEvent::Disconnected(code)) => {
                    tracing::info!(?code, "worker closed the connection");
                    shutdown.shutdown(ShutdownReason::ChannelClosed);
                }
                None => {
                    shutdown.shutdown(ShutdownReason::ChannelClosed);
                }
            },
        }
    };

    tracing::info!(?reason, "shutting down");
    controller.close_cache().await;
    if !socket.flush(FLUSH_TIMEOUT).await {
        tracing::warn!("worker messages still queued at exit");
    }
    Ok(reason.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_debug_without_target_fails_before_connecting() {
        let callbacks = AlgorithmCallbacks::new().start(|ctx, _broker| async move { Ok(ctx.input) });
        let err = debug_with(DebugOptions::default(), callbacks).await.unwrap_err();
        assert!(err.to_string().starts_with("unable to connect"));
    }
}
