//! Engines hosted in separate worker processes.
//!
//! The broker speaks JSON Lines to a vendor-runtime host over stdin/stdout;
//! see [`ipc_types`] for the protocol.

mod connection;
pub mod ipc_types;
mod process_manager;
mod text_engine;
mod vision_encoder;

pub use text_engine::WorkerTextEngine;
pub use vision_encoder::WorkerVisionEncoder;
