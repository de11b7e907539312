//! Image-description broker over a filesystem protocol.
//!
//! A producer drops a one-line request file naming an image; the broker
//! deletes it, runs letterbox → vision encoder → text engine, writes the
//! response body and then a completion marker. A readiness marker exists
//! while the broker is polling.

pub mod broker;
pub mod cli;
pub mod client;
pub mod ipc;
pub mod lifecycle;
pub mod logger;
pub mod signal;
pub mod watcher;

pub use broker::{serve, Broker};
pub use client::{BrokerClient, ClientError};
pub use ipc::IpcFiles;
pub use lifecycle::{EngineSet, Lifecycle, StartupError};
pub use signal::INTERRUPT_EXIT_CODE;
pub use watcher::{Cycle, RequestWatcher};
