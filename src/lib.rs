//! streamqos - task-manager QoS for a distributed streaming dataflow engine
//!
//! This library is the worker-side component of the engine's
//! Quality-of-Service subsystem. Each worker process hosts parallel task
//! instances of one or more streaming jobs; this crate collects their
//! processing latencies and channel statistics, routes them to the worker
//! elected QoS manager for each job, incrementally reconstructs a sparse
//! QoS graph from reporter announcements, and detects sequences of
//! vertices and edges whose end-to-end latency violates a declared
//! constraint. Violations trigger runtime actions (output-buffer limits,
//! task chaining) dispatched back to the worker hosting the offending
//! edge.
//!
//! # High-Level API
//!
//! The host engine talks to one [`plugin::StreamQosPlugin`] per worker:
//!
//! ```ignore
//! use streamqos::config::Configuration;
//! use streamqos::plugin::StreamQosPlugin;
//!
//! let plugin = StreamQosPlugin::new(&config, local_instance, transport, runtime.handle())?;
//!
//! // Engine callbacks:
//! plugin.register_task(&task, &job_config, plugin_data)?;
//! plugin.send_data(message);
//! plugin.shutdown().await;
//! ```
//!
//! Everything QoS-related is advisory: no error in this crate ever halts
//! task execution.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod engine;
pub mod environment;
pub mod graph;
pub mod ids;
pub mod logging;
pub mod manager;
pub mod messages;
pub mod plugin;
pub mod reporter;
pub mod time;

/// Version of the streamqos library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
