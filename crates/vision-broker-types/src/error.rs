use std::time::Duration;

/// Failure reported by (or about) one of the inference engines.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine could not be brought up. Fatal at startup.
    #[error("engine initialization failed: {0}")]
    Init(String),

    /// The vision encoder rejected or failed on a pixel buffer.
    #[error("image encoding failed: {0}")]
    Encode(String),

    /// The text engine refused to start a generation.
    #[error("generation failed to start: {0}")]
    Generate(String),

    /// A worker process sent something we could not interpret.
    #[error("engine protocol error: {0}")]
    Protocol(String),

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No terminal callback arrived within the configured inference timeout.
    #[error("no terminal state after {0:?}")]
    Timeout(Duration),

    /// A shutdown signal woke the waiter before the engine finished.
    #[error("interrupted by shutdown")]
    Interrupted,

    /// The configured backend is not compiled into this build.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}
