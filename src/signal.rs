//! Termination signals (SIGINT, SIGTERM, SIGHUP).
//!
//! The first signal wakes the control thread, which then runs the normal
//! teardown. A second one while that is pending removes the IPC artifacts and
//! exits on the spot. Either way the exit status is 128 plus the number of the
//! signal that arrived.

use std::io;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use log::warn;
use vision_broker_config::IpcPaths;
use vision_broker_engine::Interrupter;

use crate::ipc::IpcFiles;

#[cfg(unix)]
pub use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

#[cfg(not(unix))]
pub const SIGINT: i32 = 2;

/// Exit status when shutdown was not caused by a recorded signal (128 + SIGINT).
pub const INTERRUPT_EXIT_CODE: i32 = 128 + SIGINT;

/// Shell convention for "terminated by `signal`".
pub fn exit_code(signal: i32) -> i32 {
    128 + signal
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Graceful,
    Force,
}

/// Counts signals and decides what each one does.
#[derive(Debug, Default)]
pub struct SignalLatch {
    hits: AtomicUsize,
}

impl SignalLatch {
    pub fn on_signal(&self) -> SignalAction {
        if self.hits.fetch_add(1, Ordering::SeqCst) == 0 {
            SignalAction::Graceful
        } else {
            SignalAction::Force
        }
    }

    pub fn triggered(&self) -> bool {
        self.hits.load(Ordering::SeqCst) > 0
    }
}

/// Wake-up path from the handler to the control thread.
#[derive(Clone)]
pub struct ShutdownNotifier {
    interrupter: Interrupter,
    tx: Sender<()>,
    /// First signal received, 0 while none.
    signal: Arc<AtomicI32>,
}

impl ShutdownNotifier {
    pub fn new(interrupter: Interrupter) -> (Self, Receiver<()>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let notifier = Self {
            interrupter,
            tx,
            signal: Arc::default(),
        };
        (notifier, rx)
    }

    /// Record `signal`, then wake a blocked inference wait and the idle poll sleep.
    pub fn notify(&self, signal: i32) {
        let _ = self
            .signal
            .compare_exchange(0, signal, Ordering::SeqCst, Ordering::SeqCst);
        self.interrupter.interrupt();
        // A full channel means a wake-up is already pending.
        let _ = self.tx.try_send(());
    }

    pub fn received(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }

    /// Process exit status for the shutdown this notifier saw.
    pub fn exit_code(&self) -> i32 {
        self.received().map_or(INTERRUPT_EXIT_CODE, exit_code)
    }
}

fn handle(latch: &SignalLatch, signal: i32, notifier: &ShutdownNotifier, paths: &IpcPaths) {
    match latch.on_signal() {
        SignalAction::Graceful => {
            warn!("Signal {signal} received; shutting down");
            notifier.notify(signal);
        }
        SignalAction::Force => {
            warn!("Second termination signal ({signal}); exiting immediately");
            let _ = IpcFiles::new(paths.clone()).cleanup();
            std::process::exit(exit_code(signal));
        }
    }
}

/// Route SIGINT, SIGTERM and SIGHUP to `notifier` from a dedicated thread.
#[cfg(unix)]
pub fn install(notifier: ShutdownNotifier, paths: IpcPaths) -> io::Result<()> {
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::Builder::new()
        .name("signal-handler".into())
        .spawn(move || {
            let latch = SignalLatch::default();
            for signal in signals.forever() {
                handle(&latch, signal, &notifier, &paths);
            }
        })?;
    Ok(())
}

/// Console interrupts only; reported as SIGINT.
#[cfg(not(unix))]
pub fn install(notifier: ShutdownNotifier, paths: IpcPaths) -> io::Result<()> {
    let latch = SignalLatch::default();
    ctrlc::set_handler(move || handle(&latch, SIGINT, &notifier, &paths))
        .map_err(io::Error::other)
}
