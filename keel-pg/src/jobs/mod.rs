//! Background Jobs
//!
//! - `durability`: promotes due scheduled envelopes and deletes expired ones
//!
//! # Usage
//!
//! ```ignore
//! use keel_pg::jobs::durability_task;
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let queues = transport.queues().into_iter().map(|q| q as Arc<dyn DurableQueue>).collect();
//! tokio::spawn(durability_task(queues, DurabilityConfig::from_env(), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

pub mod durability;

pub use durability::{durability_task, DurabilityMetrics, DurabilitySnapshot};
