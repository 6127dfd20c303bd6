//! chantest-core library.
//!
//! # Conventions
//!
//! - **Errors**: each concern owns a `thiserror` enum; orchestration layers
//!   ([`tester`]) use `anyhow::Result` with context.
//! - **Logging**: use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod clock;
pub mod config;
pub mod downloads;
pub mod error;
pub mod fetch;
pub mod process;
pub mod selector;
pub mod solver;
pub mod stats;
pub mod status;
pub mod tester;
