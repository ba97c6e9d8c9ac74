//! Observability: log subscriber setup
//!
//! `RUST_LOG` overrides the default `info` level.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // a second init (tests, embedding applications) keeps the existing subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// Span wrapping one lifecycle operation of a task
pub fn task_span(operation: &'static str, job_id: &str, task_id: &str) -> tracing::Span {
    match operation {
        "start" => tracing::info_span!("task.start", job_id, task_id),
        "stop" => tracing::info_span!("task.stop", job_id, task_id),
        _ => tracing::info_span!("task", operation, job_id, task_id),
    }
}
