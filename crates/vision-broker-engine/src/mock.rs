//! Scripted engines for tests and hardware-free runs.
//!
//! Enabled by the `mock` feature; selectable from the config file with
//! `{"kind": "mock"}` backends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::info;
use vision_broker_types::{
    EngineError, ImageEmbedding, PixelTensor, StreamCallback, StreamEvent, TextEngine,
    VisionEncoder,
};

/// Records which engines were dropped, in order.
pub type DropLog = Arc<Mutex<Vec<&'static str>>>;

/// How a scripted generation ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    Finish,
    Error,
    /// No terminal event at all.
    Silent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateCall {
    pub prompt: String,
    pub had_embedding: bool,
}

pub struct ScriptedTextEngine {
    /// One script per call; the last one repeats.
    scripts: VecDeque<Vec<String>>,
    ending: Ending,
    delay: Option<Duration>,
    reject: bool,
    calls: Arc<Mutex<Vec<GenerateCall>>>,
    drop_log: Option<DropLog>,
}

impl ScriptedTextEngine {
    pub fn new<S: Into<String>>(fragments: impl IntoIterator<Item = S>) -> Self {
        Self {
            scripts: VecDeque::from([fragments.into_iter().map(Into::into).collect()]),
            ending: Ending::Finish,
            delay: None,
            reject: false,
            calls: Arc::default(),
            drop_log: None,
        }
    }

    /// Reply with `fragments` on the next call after the ones already scripted.
    pub fn then<S: Into<String>>(mut self, fragments: impl IntoIterator<Item = S>) -> Self {
        self.scripts
            .push_back(fragments.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_ending(mut self, ending: Ending) -> Self {
        self.ending = ending;
        self
    }

    /// Deliver events from a spawned thread, `delay` apart.
    pub fn threaded(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Refuse every `generate` call.
    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }

    pub fn with_drop_log(mut self, log: DropLog) -> Self {
        self.drop_log = Some(log);
        self
    }

    /// Shared handle to the recorded calls; stays valid after the engine is boxed.
    pub fn calls(&self) -> Arc<Mutex<Vec<GenerateCall>>> {
        self.calls.clone()
    }

    fn next_script(&mut self) -> Vec<String> {
        if self.scripts.len() > 1 {
            self.scripts.pop_front().unwrap_or_default()
        } else {
            self.scripts.front().cloned().unwrap_or_default()
        }
    }

    fn events(&mut self) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = self
            .next_script()
            .into_iter()
            .map(StreamEvent::Text)
            .collect();
        match self.ending {
            Ending::Finish => events.push(StreamEvent::Finish),
            Ending::Error => events.push(StreamEvent::Error),
            Ending::Silent => {}
        }
        events
    }
}

impl TextEngine for ScriptedTextEngine {
    fn generate(
        &mut self,
        prompt: &str,
        embedding: Option<&ImageEmbedding>,
        callback: StreamCallback,
    ) -> Result<(), EngineError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(GenerateCall {
                prompt: prompt.to_string(),
                had_embedding: embedding.is_some(),
            });
        }
        if self.reject {
            return Err(EngineError::Generate("scripted rejection".into()));
        }
        let events = self.events();
        match self.delay {
            Some(delay) => {
                thread::spawn(move || {
                    for event in events {
                        thread::sleep(delay);
                        callback(event);
                    }
                });
            }
            None => events.into_iter().for_each(|event| callback(event)),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

impl Drop for ScriptedTextEngine {
    fn drop(&mut self) {
        if let Some(log) = &self.drop_log {
            if let Ok(mut log) = log.lock() {
                log.push("text");
            }
        }
    }
}

/// Returns an embedding of the configured shape filled with the mean pixel
/// intensity (0..1).
pub struct FixedVisionEncoder {
    n_tokens: usize,
    dim: usize,
    fail: bool,
    calls: Arc<AtomicUsize>,
    drop_log: Option<DropLog>,
}

impl FixedVisionEncoder {
    pub fn new(n_tokens: usize, dim: usize) -> Self {
        info!("Mock vision encoder: {n_tokens}x{dim}");
        Self {
            n_tokens,
            dim,
            fail: false,
            calls: Arc::default(),
            drop_log: None,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn with_drop_log(mut self, log: DropLog) -> Self {
        self.drop_log = Some(log);
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl VisionEncoder for FixedVisionEncoder {
    fn encode(&mut self, pixels: &PixelTensor) -> Result<ImageEmbedding, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EngineError::Encode("scripted encoder failure".into()));
        }
        let bytes = pixels.as_bytes();
        let sum: u64 = bytes.iter().map(|&b| u64::from(b)).sum();
        #[allow(clippy::cast_precision_loss)]
        let mean = if bytes.is_empty() {
            0.0
        } else {
            sum as f32 / bytes.len() as f32 / 255.0
        };
        ImageEmbedding::new(self.n_tokens, self.dim, vec![mean; self.n_tokens * self.dim])
    }

    fn name(&self) -> &str {
        "mock"
    }
}

impl Drop for FixedVisionEncoder {
    fn drop(&mut self) {
        if let Some(log) = &self.drop_log {
            if let Ok(mut log) = log.lock() {
                log.push("vision");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{InferenceBridge, ERROR_SENTINEL};

    #[test]
    fn test_scripted_engine_records_calls() {
        let mut engine = ScriptedTextEngine::new(["a", "b"]);
        let calls = engine.calls();
        let embedding = ImageEmbedding::zeros(1, 1);
        let bridge = InferenceBridge::new(None);

        assert_eq!(bridge.run(&mut engine, "p1", Some(&embedding)).unwrap(), "ab");
        assert_eq!(bridge.run(&mut engine, "p2", None).unwrap(), "ab");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].prompt, "p1");
        assert!(calls[0].had_embedding);
        assert!(!calls[1].had_embedding);
    }

    #[test]
    fn test_scripts_advance_per_call_then_repeat() {
        let mut engine = ScriptedTextEngine::new(["one"]).then(["two"]);
        let bridge = InferenceBridge::new(None);
        assert_eq!(bridge.run(&mut engine, "p", None).unwrap(), "one");
        assert_eq!(bridge.run(&mut engine, "p", None).unwrap(), "two");
        assert_eq!(bridge.run(&mut engine, "p", None).unwrap(), "two");
    }

    #[test]
    fn test_scripted_error_ending() {
        let mut engine = ScriptedTextEngine::new(["x"]).with_ending(Ending::Error);
        let bridge = InferenceBridge::new(None);
        assert_eq!(
            bridge.run(&mut engine, "p", None).unwrap(),
            format!("x{ERROR_SENTINEL}")
        );
    }

    #[test]
    fn test_fixed_encoder_shape_and_value() {
        let mut encoder = FixedVisionEncoder::new(3, 4);
        let pixels = PixelTensor::new(1, 1, vec![255, 255, 255]).unwrap();
        let embedding = encoder.encode(&pixels).unwrap();
        assert_eq!(embedding.n_tokens(), 3);
        assert_eq!(embedding.dim(), 4);
        assert!(embedding.as_slice().iter().all(|&v| (v - 1.0).abs() < f32::EPSILON));
        assert_eq!(encoder.calls().load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_log_records_order() {
        let log = DropLog::default();
        let text = ScriptedTextEngine::new(Vec::<String>::new()).with_drop_log(log.clone());
        let vision = FixedVisionEncoder::new(1, 1).with_drop_log(log.clone());
        drop(vision);
        drop(text);
        assert_eq!(*log.lock().unwrap(), vec!["vision", "text"]);
    }
}
