//! Demo algorithm: sorts the array passed as the first input
//!
//! `ALGORUNNER__SOCKET__URL=ws://localhost:3000 cargo run --bin algorunner-sort`

use algorunner::{AlgorithmCallbacks, AlgorithmError, TaskContext};
use serde_json::Value;

fn sort_first_input(ctx: &TaskContext) -> Result<Value, AlgorithmError> {
    let mut items = ctx
        .input
        .get(0)
        .and_then(Value::as_array)
        .cloned()
        .ok_or("expected an array as the first input")?;
    items.sort_by(|a, b| match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(std::cmp::Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => std::cmp::Ordering::Equal,
    });
    Ok(Value::Array(items))
}

fn callbacks() -> AlgorithmCallbacks {
    AlgorithmCallbacks::new()
        .init(|ctx| async move {
            tracing::info!(node = %ctx.node_name, "sort initialized");
            Ok(())
        })
        .start(|ctx, _broker| async move { sort_first_input(&ctx) })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let code = algorunner::run(callbacks()).await?;
    std::process::exit(code);
}
