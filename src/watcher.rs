//! The Idle/Processing loop.
//!
//! Idle: poll for the request file every `poll_interval`. Processing: the
//! request file is deleted first, then preprocess → encode → generate →
//! publish, and back to Idle. Per-request failures are logged and the request
//! is dropped without a response.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};
use vision_broker_config::BrokerConfig;
use vision_broker_engine::{
    EngineError, ImagePreprocessor, InferenceBridge, Interrupter, PromptTemplate, ERROR_SENTINEL,
};

use crate::ipc::IpcFiles;
use crate::lifecycle::EngineSet;

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// No request file.
    Idle,
    /// A request was consumed but produced no response.
    Skipped,
    Published,
    /// Shutdown began, or the engines are gone.
    Interrupted,
}

pub struct RequestWatcher {
    files: IpcFiles,
    preprocessor: ImagePreprocessor,
    prompt: String,
    bridge: InferenceBridge,
    poll_interval: Duration,
    last_read_error: Option<String>,
}

impl RequestWatcher {
    pub fn new(files: IpcFiles, config: &BrokerConfig) -> Self {
        Self {
            files,
            preprocessor: ImagePreprocessor::new(config.engine.image_size),
            prompt: PromptTemplate::new(&config.prompt).render(true),
            bridge: InferenceBridge::new(config.inference_timeout()),
            poll_interval: config.poll_interval(),
            last_read_error: None,
        }
    }

    pub fn interrupter(&self) -> Interrupter {
        self.bridge.interrupter()
    }

    /// Check for a request once and, if there is one, process it to completion.
    pub fn poll_once(&mut self, engines: &mut EngineSet) -> Cycle {
        let request = match self.files.take_request() {
            Ok(Some(request)) => request,
            Ok(None) => return Cycle::Idle,
            Err(e) => {
                // Repeats of the same failure are only worth a debug line.
                let message = e.to_string();
                if self.last_read_error.as_deref() == Some(message.as_str()) {
                    debug!("Cannot read request file: {message}");
                } else {
                    warn!("Cannot read request file: {message}");
                    self.last_read_error = Some(message);
                }
                return Cycle::Idle;
            }
        };
        self.last_read_error = None;
        if request.as_os_str().is_empty() {
            debug!("Ignoring empty request");
            return Cycle::Skipped;
        }
        let Some((text, vision)) = engines.parts() else {
            warn!("Engines released; dropping request {}", request.display());
            return Cycle::Interrupted;
        };

        let shown = request.display();
        info!("Request received: {shown}");
        let started = Instant::now();

        let pixels = match self.preprocessor.preprocess_path(&request) {
            Ok(pixels) => pixels,
            Err(e) => {
                error!("Skipping request: {e}");
                return Cycle::Skipped;
            }
        };
        let embedding = match vision.encode(&pixels) {
            Ok(embedding) => embedding,
            Err(e) => {
                error!("Skipping request {shown}: {e}");
                return Cycle::Skipped;
            }
        };
        debug!(
            "Encoded {shown} into {}x{} in {:?}",
            embedding.n_tokens(),
            embedding.dim(),
            started.elapsed()
        );

        let response = match self.bridge.run(text, &self.prompt, Some(&embedding)) {
            Ok(response) => response,
            Err(EngineError::Interrupted) => {
                info!("Inference for {shown} interrupted by shutdown");
                return Cycle::Interrupted;
            }
            Err(e) => {
                error!("Skipping request {shown}: {e}");
                return Cycle::Skipped;
            }
        };
        if response.ends_with(ERROR_SENTINEL) {
            warn!("Text engine reported an error for {shown}");
        }
        info!(
            "Inference finished in {:?} ({} chars)",
            started.elapsed(),
            response.chars().count()
        );

        if let Err(e) = self.files.publish_response(&response) {
            error!("Cannot publish response for {shown}: {e}");
            return Cycle::Skipped;
        }
        Cycle::Published
    }

    /// Poll until `shutdown` fires or inference is interrupted.
    pub fn run(&mut self, engines: &mut EngineSet, shutdown: &Receiver<()>) {
        info!(
            "Watching {} every {:?}",
            self.files.paths().request_file.display(),
            self.poll_interval
        );
        loop {
            match self.poll_once(engines) {
                Cycle::Interrupted => break,
                Cycle::Idle => match shutdown.recv_timeout(self.poll_interval) {
                    Ok(()) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => std::thread::sleep(self.poll_interval),
                },
                Cycle::Skipped | Cycle::Published => {
                    if shutdown.try_recv().is_ok() {
                        break;
                    }
                }
            }
        }
        info!("Request watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use image::{Rgb, RgbImage};
    use vision_broker_config::{IpcPaths, DEFAULT_INSTRUCTION};
    use vision_broker_engine::mock::{Ending, FixedVisionEncoder, ScriptedTextEngine};
    use vision_broker_engine::{ImageEmbedding, StreamCallback, TextEngine};

    struct Fixture {
        dir: tempfile::TempDir,
        files: IpcFiles,
        watcher: RequestWatcher,
    }

    fn fixture(config: BrokerConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let files = IpcFiles::new(IpcPaths::in_dir(dir.path()));
        let watcher = RequestWatcher::new(files.clone(), &config);
        Fixture {
            dir,
            files,
            watcher,
        }
    }

    fn image(f: &Fixture, name: &str, width: u32, height: u32) -> String {
        let path = f.dir.path().join(name);
        RgbImage::from_pixel(width, height, Rgb([90, 160, 40]))
            .save(&path)
            .unwrap();
        path.display().to_string()
    }

    fn submit(f: &Fixture, request: &str) {
        fs::write(&f.files.paths().request_file, request).unwrap();
    }

    fn engines(text: ScriptedTextEngine) -> EngineSet {
        EngineSet::new(Box::new(text), Box::new(FixedVisionEncoder::new(4, 8)))
    }

    fn response(f: &Fixture) -> String {
        fs::read_to_string(&f.files.paths().response_file).unwrap()
    }

    #[test]
    fn test_idle_without_request() {
        let mut f = fixture(BrokerConfig::default());
        let mut engines = engines(ScriptedTextEngine::new(["x"]));
        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Idle);
        assert!(!f.files.paths().response_file.exists());
    }

    #[test]
    fn test_square_image_publishes_text_and_marker() {
        let mut f = fixture(BrokerConfig::default());
        let text = ScriptedTextEngine::new(["前方是", "人行横道。"]);
        let calls = text.calls();
        let mut engines = engines(text);
        let photo = image(&f, "photo1.png", 500, 500);
        submit(&f, &photo);

        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Published);
        assert!(!f.files.paths().request_file.exists());
        assert_eq!(response(&f), "前方是人行横道。");
        assert!(f.files.paths().completion_marker.exists());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].had_embedding);
        assert!(calls[0].prompt.contains(DEFAULT_INSTRUCTION));
        assert!(calls[0].prompt.contains("<image>\n"));
    }

    #[test]
    fn test_missing_image_is_skipped_without_response() {
        let mut f = fixture(BrokerConfig::default());
        let text = ScriptedTextEngine::new(["never"]);
        let calls = text.calls();
        let mut engines = engines(text);
        submit(&f, "/nonexistent/photo1.jpg\n");

        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Skipped);
        assert!(!f.files.paths().request_file.exists());
        assert!(!f.files.paths().response_file.exists());
        assert!(!f.files.paths().completion_marker.exists());
        assert!(calls.lock().unwrap().is_empty());

        // The loop carries on with the next request.
        let photo = image(&f, "next.png", 64, 32);
        submit(&f, &photo);
        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Published);
    }

    #[test]
    fn test_engine_error_publishes_sentinel() {
        let mut f = fixture(BrokerConfig::default());
        let mut engines = engines(ScriptedTextEngine::new(Vec::<String>::new()).with_ending(Ending::Error));
        let photo = image(&f, "wide.png", 800, 400);
        submit(&f, &photo);

        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Published);
        assert_eq!(response(&f), ERROR_SENTINEL);
        assert!(f.files.paths().completion_marker.exists());
    }

    #[test]
    fn test_encoder_failure_is_skipped() {
        let mut f = fixture(BrokerConfig::default());
        let vision = FixedVisionEncoder::new(1, 1).failing();
        let encodes = vision.calls();
        let mut engines = EngineSet::new(
            Box::new(ScriptedTextEngine::new(["x"])),
            Box::new(vision),
        );
        let photo = image(&f, "photo.png", 10, 10);
        submit(&f, &photo);

        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Skipped);
        assert_eq!(encodes.load(Ordering::SeqCst), 1);
        assert!(!f.files.paths().response_file.exists());
    }

    #[test]
    fn test_empty_request_is_skipped() {
        let mut f = fixture(BrokerConfig::default());
        let mut engines = engines(ScriptedTextEngine::new(["x"]));
        submit(&f, "\n");
        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Skipped);
        assert!(!f.files.paths().request_file.exists());
    }

    #[test]
    fn test_timeout_drops_request() {
        let config = BrokerConfig {
            inference_timeout_secs: Some(1),
            ..BrokerConfig::default()
        };
        let mut f = fixture(config);
        let mut engines = engines(ScriptedTextEngine::new(["..."]).with_ending(Ending::Silent));
        let photo = image(&f, "photo.png", 8, 8);
        submit(&f, &photo);

        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Skipped);
        assert!(!f.files.paths().response_file.exists());
    }

    #[test]
    fn test_released_engines_interrupt() {
        let mut f = fixture(BrokerConfig::default());
        let mut engines = engines(ScriptedTextEngine::new(["x"]));
        engines.release();
        let photo = image(&f, "photo.png", 8, 8);
        submit(&f, &photo);
        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Interrupted);
    }

    #[test]
    fn test_sequential_requests_get_their_own_replies() {
        let mut f = fixture(BrokerConfig::default());
        let mut engines = engines(
            ScriptedTextEngine::new(["left ", "turn"])
                .then(["stairs ", "ahead"])
                .threaded(Duration::from_millis(2)),
        );
        let first = image(&f, "first.png", 16, 16);
        let second = image(&f, "second.png", 16, 16);

        submit(&f, &first);
        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Published);
        assert_eq!(response(&f), "left turn");

        submit(&f, &second);
        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Published);
        assert_eq!(response(&f), "stairs ahead");
        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Idle);
    }

    /// Records what the producer could see on disk each time generation starts.
    struct ObservedEngine {
        inner: ScriptedTextEngine,
        paths: IpcPaths,
        seen: Arc<Mutex<Vec<(bool, Option<String>)>>>,
    }

    impl TextEngine for ObservedEngine {
        fn generate(
            &mut self,
            prompt: &str,
            embedding: Option<&ImageEmbedding>,
            callback: StreamCallback,
        ) -> Result<(), EngineError> {
            let marker = self.paths.completion_marker.exists();
            let body = fs::read_to_string(&self.paths.response_file).ok();
            self.seen.lock().unwrap().push((marker, body));
            self.inner.generate(prompt, embedding, callback)
        }

        fn name(&self) -> &str {
            "observed"
        }
    }

    fn wait_until(what: &str, check: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn drop_request(paths: &IpcPaths, image: &str) {
        let staged = paths.request_file.with_extension("staged");
        fs::write(&staged, image).unwrap();
        fs::rename(&staged, &paths.request_file).unwrap();
    }

    #[test]
    fn test_back_to_back_requests_are_served_in_turn() {
        let config = BrokerConfig {
            poll_interval_ms: 10,
            ..BrokerConfig::default()
        };
        let mut f = fixture(config);
        let first = image(&f, "first.png", 16, 16);
        let second = image(&f, "second.png", 24, 12);
        let paths = f.files.paths().clone();
        let (tx, rx) = crossbeam_channel::bounded(1);

        let producer = {
            let paths = paths.clone();
            thread::spawn(move || {
                drop_request(&paths, &first);
                wait_until("first pickup", || !paths.request_file.exists());
                // The first generation is still streaming.
                drop_request(&paths, &second);
                thread::sleep(Duration::from_millis(30));
                let queued = paths.request_file.exists() && !paths.completion_marker.exists();

                wait_until("second response", || {
                    paths.completion_marker.exists()
                        && fs::read_to_string(&paths.response_file).is_ok_and(|b| b == "stairs ahead")
                });
                tx.send(()).unwrap();
                queued
            })
        };

        let seen = Arc::new(Mutex::new(Vec::new()));
        let text = ObservedEngine {
            inner: ScriptedTextEngine::new(["left ", "turn"])
                .then(["stairs ", "ahead"])
                .threaded(Duration::from_millis(40)),
            paths,
            seen: seen.clone(),
        };
        let mut engines = EngineSet::new(Box::new(text), Box::new(FixedVisionEncoder::new(4, 8)));
        f.watcher.run(&mut engines, &rx);

        assert!(producer.join().unwrap(), "second request was taken mid-generation");
        // The second generation only starts once the first body and marker are out.
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(false, None), (true, Some("left turn".to_string()))]
        );
        assert_eq!(response(&f), "stairs ahead");
    }

    #[test]
    fn test_image_without_extension_is_published() {
        let mut f = fixture(BrokerConfig::default());
        let mut engines = engines(ScriptedTextEngine::new(["ok"]));
        let path = f.dir.path().join("frame_0001");
        RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]))
            .save_with_format(&path, image::ImageFormat::Png)
            .unwrap();
        submit(&f, &path.display().to_string());

        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Published);
        assert_eq!(response(&f), "ok");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_image_path_is_published() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut f = fixture(BrokerConfig::default());
        let mut engines = engines(ScriptedTextEngine::new(["ok"]));
        // "测试.png" in GBK
        let path = f.dir.path().join(OsStr::from_bytes(b"\xb2\xe2\xca\xd4.png"));
        RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])).save(&path).unwrap();
        fs::write(
            &f.files.paths().request_file,
            [path.as_os_str().as_bytes(), &b"\n"[..]].concat(),
        )
        .unwrap();

        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Published);
        assert_eq!(response(&f), "ok");
    }

    #[test]
    fn test_unreadable_request_is_cleared() {
        let mut f = fixture(BrokerConfig::default());
        let mut engines = engines(ScriptedTextEngine::new(["x"]));
        fs::create_dir(&f.files.paths().request_file).unwrap();

        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Idle);
        assert!(!f.files.paths().request_file.exists());
        assert_eq!(f.watcher.poll_once(&mut engines), Cycle::Idle);
    }

    #[test]
    fn test_run_serves_requests_until_shutdown() {
        let config = BrokerConfig {
            poll_interval_ms: 20,
            ..BrokerConfig::default()
        };
        let mut f = fixture(config);
        let photo = image(&f, "photo.png", 30, 20);
        let paths = f.files.paths().clone();
        let (tx, rx) = crossbeam_channel::bounded(1);

        let producer = thread::spawn(move || {
            drop_request(&paths, &photo);
            let deadline = Instant::now() + Duration::from_secs(5);
            while !paths.completion_marker.exists() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            let body = fs::read_to_string(&paths.response_file).unwrap();
            tx.send(()).unwrap();
            body
        });

        let mut engines = engines(ScriptedTextEngine::new(["ok"]));
        f.watcher.run(&mut engines, &rx);
        assert_eq!(producer.join().unwrap(), "ok");
    }
}
