//! Wires startup, the request loop and teardown together.

use std::io;

use crossbeam_channel::Receiver;
use vision_broker_config::{BrokerConfig, IpcPaths};
use vision_broker_engine::{
    open_text_engine, open_vision_encoder, EngineError, Interrupter, TextEngine, VisionEncoder,
};

use crate::ipc::IpcFiles;
use crate::lifecycle::{Lifecycle, StartupError};
use crate::signal::{self, ShutdownNotifier};
use crate::watcher::RequestWatcher;

pub struct Broker {
    files: IpcFiles,
    watcher: RequestWatcher,
}

impl Broker {
    pub fn new(config: &BrokerConfig) -> Self {
        let files = IpcFiles::new(config.ipc.clone());
        Self {
            watcher: RequestWatcher::new(files.clone(), config),
            files,
        }
    }

    pub fn interrupter(&self) -> Interrupter {
        self.watcher.interrupter()
    }

    /// Start the engines, serve until `shutdown` fires, then tear down.
    pub fn run<T, V>(
        mut self,
        init_text: T,
        init_vision: V,
        shutdown: &Receiver<()>,
    ) -> Result<(), StartupError>
    where
        T: FnOnce() -> Result<Box<dyn TextEngine>, EngineError>,
        V: FnOnce() -> Result<Box<dyn VisionEncoder>, EngineError>,
    {
        let mut lifecycle = Lifecycle::start(self.files, init_text, init_vision)?;
        self.watcher.run(lifecycle.engines_mut(), shutdown);
        lifecycle.shutdown();
        Ok(())
    }
}

/// Serve with the configured engine backends until a termination signal.
///
/// Returns the process exit status derived from that signal.
pub fn serve(config: &BrokerConfig) -> Result<i32, StartupError> {
    serve_with(config, signal::install)
}

fn serve_with<I>(config: &BrokerConfig, install: I) -> Result<i32, StartupError>
where
    I: FnOnce(ShutdownNotifier, IpcPaths) -> io::Result<()>,
{
    let broker = Broker::new(config);
    let (notifier, shutdown) = ShutdownNotifier::new(broker.interrupter());
    install(notifier.clone(), config.ipc.clone()).map_err(StartupError::Signals)?;

    broker.run(
        || open_text_engine(&config.engine),
        || open_vision_encoder(&config.engine),
        &shutdown,
    )?;
    Ok(notifier.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;
    use std::time::{Duration, Instant};

    use image::{Rgb, RgbImage};
    use vision_broker_config::{EngineConfig, TextBackend, VisionBackend};
    use vision_broker_engine::mock::{DropLog, FixedVisionEncoder, ScriptedTextEngine};

    use crate::client::BrokerClient;

    #[test]
    fn test_serves_client_then_cleans_up_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("photo1.png");
        RgbImage::from_pixel(500, 500, Rgb([10, 20, 30]))
            .save(&image)
            .unwrap();
        let paths = IpcPaths::in_dir(dir.path().join("ipc"));
        fs::create_dir_all(dir.path().join("ipc")).unwrap();

        let config = BrokerConfig {
            ipc: paths.clone(),
            poll_interval_ms: 20,
            ..BrokerConfig::default()
        };
        let broker = Broker::new(&config);
        let (notifier, shutdown) = ShutdownNotifier::new(broker.interrupter());
        let log = DropLog::default();
        let text_log = log.clone();
        let vision_log = log.clone();

        let server = thread::spawn(move || {
            broker.run(
                move || {
                    Ok(Box::new(
                        ScriptedTextEngine::new(["道路", "畅通。"]).with_drop_log(text_log),
                    ) as Box<dyn TextEngine>)
                },
                move || {
                    Ok(Box::new(FixedVisionEncoder::new(4, 4).with_drop_log(vision_log))
                        as Box<dyn VisionEncoder>)
                },
                &shutdown,
            )
        });

        let client = BrokerClient::new(paths.clone(), Duration::from_millis(10));
        client.wait_until_ready(Duration::from_secs(10)).unwrap();
        let text = client.describe(&image, Duration::from_secs(10)).unwrap();
        assert_eq!(text, "道路畅通。");

        notifier.notify(signal::SIGINT);
        server.join().unwrap().unwrap();

        for path in paths.all() {
            assert!(!path.exists(), "{} survived shutdown", path.display());
        }
        assert_eq!(*log.lock().unwrap(), vec!["vision", "text"]);
    }

    #[test]
    fn test_startup_failure_leaves_no_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IpcPaths::in_dir(dir.path());
        let config = BrokerConfig {
            ipc: paths.clone(),
            ..BrokerConfig::default()
        };
        let (_tx, shutdown) = crossbeam_channel::bounded::<()>(1);
        let started = Instant::now();

        let result = Broker::new(&config).run(
            || Err(EngineError::Init("rkllm_init failed".into())),
            || unreachable!("vision must not start after text failure"),
            &shutdown,
        );

        assert!(matches!(result, Err(StartupError::TextEngine(_))));
        assert!(!paths.ready_marker.exists());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_signal_install_failure_is_a_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IpcPaths::in_dir(dir.path());
        let config = BrokerConfig {
            ipc: paths.clone(),
            ..BrokerConfig::default()
        };

        let result = serve_with(&config, |_, _| {
            Err(io::Error::new(io::ErrorKind::Other, "handler already taken"))
        });

        assert!(matches!(result, Err(StartupError::Signals(_))));
        assert!(!paths.ready_marker.exists());
    }

    fn mock_engines() -> EngineConfig {
        EngineConfig {
            text_backend: TextBackend::Mock {
                reply: vec!["ok".into()],
            },
            vision_backend: VisionBackend::Mock,
            ..EngineConfig::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_serve_reports_signal_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            ipc: IpcPaths::in_dir(dir.path()),
            poll_interval_ms: 10,
            engine: mock_engines(),
            ..BrokerConfig::default()
        };

        let code = serve_with(&config, |notifier, _| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                notifier.notify(signal::SIGTERM);
            });
            Ok(())
        })
        .unwrap();
        assert_eq!(code, 143);
    }
}
