//! Startup, readiness and teardown.
//!
//! Startup clears stale artifacts, brings up the text engine then the vision
//! encoder, and only then creates the readiness marker. Teardown is a single
//! idempotent path shared by orderly exit, signals and `Drop`.

use std::io;

use log::{info, warn};
use vision_broker_engine::{EngineError, TextEngine, VisionEncoder};

use crate::ipc::{remove_if_exists, IpcFiles};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("cannot install signal handlers: {0}")]
    Signals(#[source] io::Error),
    #[error("cannot clear stale IPC files: {0}")]
    Cleanup(#[source] io::Error),
    #[error("text engine failed to initialize: {0}")]
    TextEngine(#[source] EngineError),
    #[error("vision engine failed to initialize: {0}")]
    VisionEngine(#[source] EngineError),
    #[error("cannot create readiness marker: {0}")]
    Readiness(#[source] io::Error),
}

/// Owns both engines. Each is released at most once, vision first.
pub struct EngineSet {
    vision: Option<Box<dyn VisionEncoder>>,
    text: Option<Box<dyn TextEngine>>,
}

impl EngineSet {
    pub fn new(text: Box<dyn TextEngine>, vision: Box<dyn VisionEncoder>) -> Self {
        Self {
            vision: Some(vision),
            text: Some(text),
        }
    }

    /// Both engines, or `None` once released.
    pub fn parts(&mut self) -> Option<(&mut dyn TextEngine, &mut dyn VisionEncoder)> {
        let text: &mut dyn TextEngine = self.text.as_deref_mut()?;
        let vision: &mut dyn VisionEncoder = self.vision.as_deref_mut()?;
        Some((text, vision))
    }

    pub fn is_released(&self) -> bool {
        self.text.is_none() && self.vision.is_none()
    }

    pub fn release(&mut self) {
        if let Some(vision) = self.vision.take() {
            info!("Releasing vision encoder ({})", vision.name());
            drop(vision);
        }
        if let Some(text) = self.text.take() {
            info!("Releasing text engine ({})", text.name());
            drop(text);
        }
    }
}

impl Drop for EngineSet {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct Lifecycle {
    files: IpcFiles,
    engines: EngineSet,
    torn_down: bool,
}

impl Lifecycle {
    /// Run the startup sequence. On error nothing is left behind: no readiness
    /// marker, and any engine already up is released.
    pub fn start<T, V>(files: IpcFiles, init_text: T, init_vision: V) -> Result<Self, StartupError>
    where
        T: FnOnce() -> Result<Box<dyn TextEngine>, EngineError>,
        V: FnOnce() -> Result<Box<dyn VisionEncoder>, EngineError>,
    {
        info!("Clearing stale IPC files");
        files.cleanup().map_err(StartupError::Cleanup)?;

        info!("Initializing text engine");
        let text = init_text().map_err(StartupError::TextEngine)?;
        info!("Initializing vision encoder");
        let vision = init_vision().map_err(StartupError::VisionEngine)?;
        let engines = EngineSet::new(text, vision);

        files.signal_ready().map_err(StartupError::Readiness)?;
        info!(
            "Service ready ({})",
            files.paths().ready_marker.display()
        );
        Ok(Self {
            files,
            engines,
            torn_down: false,
        })
    }

    pub fn files(&self) -> &IpcFiles {
        &self.files
    }

    pub fn engines_mut(&mut self) -> &mut EngineSet {
        &mut self.engines
    }

    /// Withdraw readiness, release vision then text, remove all artifacts.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        info!("Shutting down");
        if let Err(e) = remove_if_exists(&self.files.paths().ready_marker) {
            warn!("Cannot withdraw readiness marker: {e}");
        }
        self.engines.release();
        if let Err(e) = self.files.cleanup() {
            warn!("IPC cleanup incomplete: {e}");
        }
        info!("Shutdown complete");
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
