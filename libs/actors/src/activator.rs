//! Process Runtime
//!
//! Owns the root manager and the RPC dispatch loop of one process and runs
//! the signal-driven termination sequence:
//!
//! ```text
//! Created ──run──▶ Running ──signal──▶ TermRequested ──▶ TermInProgress ──▶ Exited
//!                                            │
//!                                            └─ watchdog armed for terminate_timeout
//! ```
//!
//! The graceful path stops the object tree, then the RPC runtime. If it
//! finishes before the watchdog fires, the original signal is re-raised with
//! its default disposition so the exit status reflects it. Otherwise the
//! watchdog restores default dispositions and kills the process.

use crate::context::RuntimeContext;
use crate::error::{contain_step, panic_message, Result, RuntimeError};
use crate::manager::Manager;
use crate::signals::{spawn_signal_listener, OsProcess, ProcessControl, SignalListener, TERMINATION_SIGNALS};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Bound on the critical section that admits the first signal of a burst
const SIGNAL_GATE_TIMEOUT: Duration = Duration::from_millis(50);

static INSTANCE_LIVE: AtomicBool = AtomicBool::new(false);
static PANIC_HOOK: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TermPhase {
    Created,
    Running,
    TermRequested,
    TermInProgress,
    Exited,
}

impl fmt::Display for TermPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TermPhase::Created => "created",
            TermPhase::Running => "running",
            TermPhase::TermRequested => "term_requested",
            TermPhase::TermInProgress => "term_in_progress",
            TermPhase::Exited => "exited",
        };
        f.write_str(s)
    }
}

pub struct ProcessRuntime {
    ctx: RuntimeContext,
    root: Arc<Manager>,
    self_ref: Weak<ProcessRuntime>,

    phase: Mutex<TermPhase>,
    phase_cv: Condvar,
    signal_gate: Mutex<()>,
    received_signal: Mutex<Option<Signal>>,
    forced: AtomicBool,

    dispatch: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<SignalListener>>,
    control: Arc<dyn ProcessControl>,
}

impl fmt::Debug for ProcessRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRuntime")
            .field("root", &self.root.name())
            .field("phase", &self.phase())
            .field("signal", &self.received_signal())
            .finish_non_exhaustive()
    }
}

impl ProcessRuntime {
    pub fn new(ctx: RuntimeContext, root: Arc<Manager>) -> Arc<Self> {
        Self::with_process_control(ctx, root, Arc::new(OsProcess))
    }

    /// Use `control` for re-raise and force-kill instead of the real process
    pub fn with_process_control(
        ctx: RuntimeContext,
        root: Arc<Manager>,
        control: Arc<dyn ProcessControl>,
    ) -> Arc<Self> {
        if INSTANCE_LIVE.swap(true, Ordering::AcqRel) {
            warn!("More than one ProcessRuntime alive in this process");
        }
        Arc::new_cyclic(|me| Self {
            ctx,
            root,
            self_ref: me.clone(),
            phase: Mutex::new(TermPhase::Created),
            phase_cv: Condvar::new(),
            signal_gate: Mutex::new(()),
            received_signal: Mutex::new(None),
            forced: AtomicBool::new(false),
            dispatch: Mutex::new(None),
            listener: Mutex::new(None),
            control,
        })
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn root(&self) -> &Arc<Manager> {
        &self.root
    }

    pub fn phase(&self) -> TermPhase {
        *self.phase.lock()
    }

    /// Signal that started termination, if any
    pub fn received_signal(&self) -> Option<Signal> {
        *self.received_signal.lock()
    }

    /// Whether the watchdog had to force the exit
    pub fn was_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    fn set_phase(&self, next: TermPhase) {
        let mut phase = self.phase.lock();
        debug!(from = %*phase, to = %next, "Termination phase");
        *phase = next;
        self.phase_cv.notify_all();
    }

    /// Activate the object tree and start the RPC dispatch loop.
    ///
    /// With `own_thread` the loop runs on a dedicated thread and this returns
    /// immediately. Otherwise the caller's thread runs the loop and this
    /// returns once the runtime has shut down.
    pub fn run(&self, own_thread: bool) -> Result<()> {
        {
            let phase = self.phase.lock();
            if *phase != TermPhase::Created {
                return Err(RuntimeError::invalid_state(
                    "process runtime",
                    *phase,
                    "run",
                ));
            }
        }

        let started = Instant::now();
        install_panic_hook();

        if let Err(e) = self.start_tree() {
            error!(root = %self.root.name(), error = %e, "Object tree failed to start");
            if let Err(e) = self.root.deactivate() {
                warn!(error = %e, "Cleanup after failed start incomplete");
            }
            self.set_phase(TermPhase::Exited);
            return Err(e);
        }
        self.set_phase(TermPhase::Running);

        if self.ctx.config().handle_signals {
            let me = self.self_ref.clone();
            let listener = spawn_signal_listener(move |sig| {
                if let Some(runtime) = me.upgrade() {
                    runtime.handle_signal(sig);
                }
            });
            match listener {
                Ok(listener) => *self.listener.lock() = Some(listener),
                Err(e) => {
                    error!(error = %e, "Signal handling unavailable, stopping");
                    self.shutdown()?;
                    return Err(e);
                }
            }
        }

        info!(
            root = %self.root.name(),
            objects = self.root.objects_count(),
            own_thread,
            startup_ms = started.elapsed().as_millis() as u64,
            "Process runtime running"
        );

        let rpc = self.ctx.rpc().clone();
        if own_thread {
            let handle = thread::Builder::new()
                .name("rpc-dispatch".to_string())
                .spawn(move || {
                    if let Err(e) = rpc.run_dispatch_loop() {
                        error!(error = %e, "RPC dispatch loop failed");
                    }
                })
                .map_err(|e| RuntimeError::io("failed to start RPC dispatch thread", e))?;
            *self.dispatch.lock() = Some(handle);
            return Ok(());
        }

        let result = rpc.run_dispatch_loop();
        if self.phase() == TermPhase::Running {
            self.shutdown()?;
        } else {
            self.join();
        }
        result
    }

    fn start_tree(&self) -> Result<()> {
        let root_object = self.root.object();
        if root_object.adapter().is_none() {
            root_object.bind_adapter(self.ctx.rpc().clone());
        }
        self.root.initialize()?;
        self.root.activate()
    }

    /// Entry point of the termination sequence for `sig`.
    ///
    /// Only the first signal while running is acted upon; later ones are
    /// ignored. Returns after the graceful path has finished (or, with a
    /// real process, does not return at all).
    pub fn handle_signal(&self, sig: Signal) {
        {
            let Some(_gate) = self.signal_gate.try_lock_for(SIGNAL_GATE_TIMEOUT) else {
                debug!(signal = ?sig, "Termination already being admitted, signal ignored");
                return;
            };
            let mut phase = self.phase.lock();
            if *phase != TermPhase::Running {
                debug!(signal = ?sig, phase = %*phase, "Signal ignored");
                return;
            }
            *phase = TermPhase::TermRequested;
            self.phase_cv.notify_all();
            *self.received_signal.lock() = Some(sig);
        }

        let timeout = self.ctx.config().terminate_timeout();
        info!(
            signal = ?sig,
            timeout_ms = timeout.as_millis() as u64,
            "Termination requested"
        );
        let watchdog = self.arm_watchdog(timeout);

        self.set_phase(TermPhase::TermInProgress);
        self.stop_everything(|root| root.terminate(sig));
        self.set_phase(TermPhase::Exited);
        disarm(watchdog);

        if self.was_forced() {
            return;
        }
        if let Err(e) = self.control.reraise(sig) {
            error!(signal = ?sig, error = %e, "Failed to re-raise termination signal");
        }
    }

    /// Run the graceful path without a signal
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                TermPhase::Running => {
                    *phase = TermPhase::TermInProgress;
                    self.phase_cv.notify_all();
                }
                TermPhase::Created => {
                    *phase = TermPhase::Exited;
                    self.phase_cv.notify_all();
                    return Ok(());
                }
                _ => {
                    self.phase_cv
                        .wait_while(&mut phase, |p| *p != TermPhase::Exited);
                    return Ok(());
                }
            }
        }

        info!("Shutdown requested");
        let watchdog = self.arm_watchdog(self.ctx.config().terminate_timeout());
        self.stop_everything(|root| root.deactivate());
        self.set_phase(TermPhase::Exited);
        disarm(watchdog);
        Ok(())
    }

    /// Block until the runtime has exited. Returns at once if it never ran.
    pub fn join(&self) {
        let mut phase = self.phase.lock();
        self.phase_cv.wait_while(&mut phase, |p| {
            matches!(
                p,
                TermPhase::Running | TermPhase::TermRequested | TermPhase::TermInProgress
            )
        });
    }

    /// Ask this process to stop by sending it SIGTERM
    pub fn terminate(&self) -> Result<()> {
        info!("Requesting process termination");
        signal::kill(Pid::this(), Signal::SIGTERM)
            .map_err(|e| RuntimeError::system(format!("failed to send SIGTERM: {e}")))
    }

    fn stop_everything(&self, stop_tree: impl FnOnce(&Manager) -> Result<()>) {
        let started = Instant::now();

        if let Err(e) = contain_step(self.root.name(), "terminate", || stop_tree(self.root.as_ref())) {
            error!(root = %self.root.name(), error = %e, "Object tree did not stop cleanly");
        }

        let rpc = self.ctx.rpc();
        rpc.stop_accepting_requests();
        rpc.destroy();

        let dispatch = self.dispatch.lock().take();
        if let Some(handle) = dispatch {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("RPC dispatch thread panicked");
            }
        }

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.stop();
        }

        info!(
            shutdown_ms = started.elapsed().as_millis() as u64,
            "Process runtime stopped"
        );
    }

    fn arm_watchdog(&self, timeout: Duration) -> Option<JoinHandle<()>> {
        let me = self.self_ref.upgrade()?;
        match thread::Builder::new()
            .name("term-watchdog".to_string())
            .spawn(move || me.watch(timeout))
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "Failed to arm termination watchdog");
                None
            }
        }
    }

    fn watch(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        {
            let mut phase = self.phase.lock();
            while *phase != TermPhase::Exited {
                if self.phase_cv.wait_until(&mut phase, deadline).timed_out() {
                    break;
                }
            }
            if *phase == TermPhase::Exited {
                debug!("Termination watchdog disarmed");
                return;
            }
        }

        error!(
            timeout_ms = timeout.as_millis() as u64,
            "Graceful termination timed out"
        );
        self.forced.store(true, Ordering::Release);
        for sig in TERMINATION_SIGNALS {
            if let Err(e) = self.control.restore_default(sig) {
                warn!(signal = ?sig, error = %e, "Failed to restore default disposition");
            }
        }
        self.control.force_kill();
    }
}

fn disarm(watchdog: Option<JoinHandle<()>>) {
    if let Some(handle) = watchdog {
        if handle.join().is_err() {
            error!("Termination watchdog panicked");
        }
    }
}

impl Drop for ProcessRuntime {
    fn drop(&mut self) {
        INSTANCE_LIVE.store(false, Ordering::Release);
        info!(phase = %self.phase(), "Process runtime released");
    }
}

/// Log panics before the previously installed hook runs
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let thread = thread::current();
            error!(
                thread = thread.name().unwrap_or("unnamed"),
                panic = %panic_message(info.payload()),
                location = ?info.location().map(|l| l.to_string()),
                "Panic raised"
            );
            previous(info);
        }));
    });
}
