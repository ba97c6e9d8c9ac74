//! Algorunner - in-container algorithm runtime
//!
//! Modules:
//! - **algorithm**: user callbacks, the algorithm registry and the stateless adapter
//! - **broker**: remote execution of algorithms and sub-pipelines through the worker
//! - **cache**: peer data cache serving the latest result to downstream tasks
//! - **config**: configuration loading (TOML + environment variables)
//! - **core**: task context, lifecycle state, errors, shutdown and the controller
//! - **storage**: object stores, result placement and `$$` input resolution
//! - **streaming**: stream message relay between the worker and the algorithm
//! - **transport**: worker protocol messages and the WebSocket channel

pub mod algorithm;
pub mod broker;
pub mod cache;
pub mod config;
pub mod core;
pub mod observability;
pub mod runner;
pub mod storage;
pub mod streaming;
pub mod transport;

pub use algorithm::{Algorithm, AlgorithmCallbacks, AlgorithmError, AlgorithmRegistry, LoadError};
pub use broker::RemoteExecutionBroker;
pub use self::config::{load_config, DebugOptions, RunnerConfig, StorageMode};
pub use self::core::{RunnerBuilder, TaskContext, TaskController};
pub use runner::{debug, debug_with, run, run_from_registry, run_with_config};
