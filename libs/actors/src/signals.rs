//! Process signals
//!
//! A dedicated thread runs a single-threaded tokio runtime that listens for
//! SIGINT, SIGTERM, SIGQUIT and SIGABRT and hands each one to a synchronous
//! handler. Process-level actions (restoring default dispositions,
//! re-raising, force-kill) go through [`ProcessControl`] so tests can record
//! them instead of killing the test binary.

use crate::error::{Result, RuntimeError};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::Pid;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::signal::unix::{signal as listen, Signal as UnixSignal, SignalKind};
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Signals that start the termination sequence
pub const TERMINATION_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGABRT,
];

/// OS process actions used by the termination sequence
pub trait ProcessControl: Send + Sync {
    /// Put back the default disposition for `signal`
    fn restore_default(&self, signal: Signal) -> Result<()>;

    /// Restore the default disposition and deliver `signal` to this process
    fn reraise(&self, signal: Signal) -> Result<()>;

    /// Kill this process immediately
    fn force_kill(&self);
}

/// The real process
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcess;

impl ProcessControl for OsProcess {
    fn restore_default(&self, sig: Signal) -> Result<()> {
        // SAFETY: installing SIG_DFL does not run any handler code
        unsafe { signal::signal(sig, SigHandler::SigDfl) }
            .map(|_| ())
            .map_err(|e| RuntimeError::system(format!("failed to restore {sig:?}: {e}")))
    }

    fn reraise(&self, sig: Signal) -> Result<()> {
        self.restore_default(sig)?;
        info!(signal = ?sig, "Re-raising termination signal");
        signal::raise(sig).map_err(|e| RuntimeError::system(format!("failed to raise {sig:?}: {e}")))
    }

    fn force_kill(&self) {
        error!("Forcing process exit");
        if let Err(e) = signal::kill(Pid::this(), Signal::SIGKILL) {
            error!(error = %e, "SIGKILL failed, aborting");
            std::process::abort();
        }
    }
}

/// Handle to the signal listener thread
#[derive(Debug)]
pub struct SignalListener {
    stop: Arc<Notify>,
    thread: Option<JoinHandle<()>>,
}

impl SignalListener {
    /// Stop listening. Joins the listener unless called from it.
    pub fn stop(mut self) {
        self.stop.notify_one();
        let Some(handle) = self.thread.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("Signal listener panicked");
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.stop.notify_one();
    }
}

/// Start the listener thread. Returns once the handlers are installed.
pub fn spawn_signal_listener<F>(handler: F) -> Result<SignalListener>
where
    F: Fn(Signal) + Send + 'static,
{
    let stop = Arc::new(Notify::new());
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| RuntimeError::io("failed to build signal runtime", e))?;

    let listener_stop = stop.clone();
    let thread = thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || {
            runtime.block_on(listen_loop(handler, listener_stop, ready_tx));
        })
        .map_err(|e| RuntimeError::io("failed to start signal listener", e))?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            info!(signals = ?TERMINATION_SIGNALS, "Signal handlers installed");
            Ok(SignalListener {
                stop,
                thread: Some(thread),
            })
        }
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(RuntimeError::system("signal listener exited during setup"))
        }
    }
}

fn install(sig: Signal) -> Result<UnixSignal> {
    listen(SignalKind::from_raw(sig as i32))
        .map_err(|e| RuntimeError::io(format!("failed to install {sig:?} handler"), e))
}

fn install_all() -> Result<(UnixSignal, UnixSignal, UnixSignal, UnixSignal)> {
    Ok((
        install(Signal::SIGINT)?,
        install(Signal::SIGTERM)?,
        install(Signal::SIGQUIT)?,
        install(Signal::SIGABRT)?,
    ))
}

async fn listen_loop<F>(
    handler: F,
    stop: Arc<Notify>,
    ready: crossbeam_channel::Sender<Result<()>>,
) where
    F: Fn(Signal) + Send + 'static,
{
    let (mut int, mut term, mut quit, mut abrt) = match install_all() {
        Ok(streams) => {
            let _ = ready.send(Ok(()));
            streams
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    loop {
        let sig = tokio::select! {
            _ = stop.notified() => break,
            Some(()) = int.recv() => Signal::SIGINT,
            Some(()) = term.recv() => Signal::SIGTERM,
            Some(()) = quit.recv() => Signal::SIGQUIT,
            Some(()) = abrt.recv() => Signal::SIGABRT,
            else => break,
        };
        info!(signal = ?sig, "Signal received");
        handler(sig);
    }
    debug!("Signal listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_starts_and_stops() {
        let listener = spawn_signal_listener(|_| {}).unwrap();
        listener.stop();
    }

    #[test]
    fn test_termination_signal_set() {
        assert!(TERMINATION_SIGNALS.contains(&Signal::SIGTERM));
        assert!(!TERMINATION_SIGNALS.contains(&Signal::SIGKILL));
    }
}
