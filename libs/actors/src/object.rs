//! Runtime Object
//!
//! The addressable unit of the runtime: a mailbox, a lifecycle state, an
//! optional worker thread and, while active, a reference bound in the remote
//! directory.
//!
//! # Lifecycle
//!
//! ```text
//! Unregistered ──activate──▶ Registering ──▶ Active ──deactivate──▶ Deactivating ──▶ Stopped
//!                                 │
//!                                 └──(retries exhausted / hook failed)──▶ Error
//! ```
//!
//! `Stopped` and `Error` objects can be activated again.
//!
//! # Threading
//!
//! An object with a real identity gets one worker thread (unless thread
//! creation is disabled). The worker blocks only inside `Mailbox::wait`;
//! objects without a worker are driven by their caller via
//! [`RuntimeObject::process_pending`].
//!
//! # Lock ordering
//!
//! `state` is never held while calling into hooks, the directory or the RPC
//! runtime. `behavior` is held only for the duration of one hook call.

use crate::context::RuntimeContext;
use crate::error::{contain_user, Result, RuntimeError};
use crate::mailbox::{Mailbox, QueueStats};
use crate::manager::Manager;
use crate::timers::TimerList;
use crate::transport::{ObjectKey, RemoteReference, RpcRuntime, Servant};
use nix::sys::signal::Signal;
use parking_lot::{Condvar, Mutex, RwLock};
use plant_types::{
    Message, MessageBody, ObjectId, Priority, SensorUpdate, SystemMessage, TimerFired, TimerId,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    Unregistered,
    Registering,
    Active,
    Deactivating,
    Stopped,
    Error,
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectState::Unregistered => "unregistered",
            ObjectState::Registering => "registering",
            ObjectState::Active => "active",
            ObjectState::Deactivating => "deactivating",
            ObjectState::Stopped => "stopped",
            ObjectState::Error => "error",
        };
        f.write_str(s)
    }
}

/// User-supplied message and lifecycle handlers
///
/// Every hook runs with the object's behavior locked, so hooks of one object
/// never run concurrently. Errors and panics are contained by the runtime
/// and logged; they never stop the worker.
pub trait ObjectBehavior: Send + 'static {
    fn sensor_info(&mut self, _obj: &RuntimeObject, _update: &SensorUpdate) -> anyhow::Result<()> {
        Ok(())
    }

    fn timer_info(&mut self, _obj: &RuntimeObject, _timer: &TimerFired) -> anyhow::Result<()> {
        Ok(())
    }

    fn sys_command(&mut self, _obj: &RuntimeObject, _cmd: &SystemMessage) -> anyhow::Result<()> {
        Ok(())
    }

    /// Confirmations and application payloads
    fn other_message(&mut self, obj: &RuntimeObject, msg: &Message) -> anyhow::Result<()> {
        warn!(object = %obj.name(), kind = ?msg.kind(), "Unhandled message kind");
        Ok(())
    }

    /// Called during activation, after registration and before the worker starts
    fn activate_object(&mut self, _obj: &RuntimeObject) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called during deactivation, before the object leaves the directory
    fn deactivate_object(&mut self, _obj: &RuntimeObject) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on the signal-driven termination path, before deactivation
    fn sigterm(&mut self, _obj: &RuntimeObject, _signal: Signal) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Behavior that ignores everything (plain managers, placeholders)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBehavior;

impl ObjectBehavior for NoopBehavior {}

#[derive(Debug, Default)]
pub struct ObjectMetrics {
    pub messages_processed: AtomicU64,
    pub handler_failures: AtomicU64,
    pub activations: AtomicU64,
}

/// Serializable snapshot of an object
#[derive(Debug, Clone, Serialize)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub name: String,
    pub state: ObjectState,
    pub threaded: bool,
    pub pending: usize,
    pub lost: u64,
    pub capacity: usize,
    pub messages_processed: u64,
    pub handler_failures: u64,
    pub queues: Vec<QueueStats>,
}

impl fmt::Display for ObjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) state={} thread={} pending={}/{} lost={} processed={} failures={}",
            self.name,
            self.id.into_inner(),
            self.state,
            if self.threaded { "yes" } else { "no" },
            self.pending,
            self.capacity,
            self.lost,
            self.messages_processed,
            self.handler_failures,
        )
    }
}

pub struct RuntimeObject {
    id: ObjectId,
    name: String,
    ctx: RuntimeContext,
    self_ref: Weak<RuntimeObject>,

    state: Mutex<ObjectState>,
    active: AtomicBool,
    create_thread: AtomicBool,

    mailbox: Mailbox,
    timers: Mutex<TimerList>,
    behavior: Mutex<Box<dyn ObjectBehavior>>,
    /// Thread currently inside a message hook
    handler_thread: Mutex<Option<ThreadId>>,
    /// Deactivation requested from inside a hook; finished once it returns
    deferred_stop: AtomicBool,

    adapter: RwLock<Option<Arc<dyn RpcRuntime>>>,
    reference: RwLock<Option<RemoteReference>>,
    registered: AtomicBool,
    manager: RwLock<Weak<Manager>>,

    worker: Mutex<Option<JoinHandle<()>>>,
    working: Mutex<bool>,
    working_cv: Condvar,

    metrics: ObjectMetrics,
}

impl fmt::Debug for RuntimeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeObject")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pending", &self.mailbox.len())
            .finish_non_exhaustive()
    }
}

impl RuntimeObject {
    pub fn new(
        ctx: &RuntimeContext,
        id: ObjectId,
        name: impl Into<String>,
        behavior: impl ObjectBehavior,
    ) -> Result<Arc<Self>> {
        Self::with_boxed_behavior(ctx, id, name, Box::new(behavior))
    }

    pub fn with_boxed_behavior(
        ctx: &RuntimeContext,
        id: ObjectId,
        name: impl Into<String>,
        behavior: Box<dyn ObjectBehavior>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RuntimeError::configuration(
                format!("object {id} has an empty name"),
                Some("name"),
            ));
        }

        let config = ctx.config();
        debug!(object = %name, id = %id, capacity = config.mailbox_capacity, "Creating runtime object");

        Ok(Arc::new_cyclic(|me| Self {
            id,
            name,
            ctx: ctx.clone(),
            self_ref: me.clone(),
            state: Mutex::new(ObjectState::Unregistered),
            active: AtomicBool::new(false),
            create_thread: AtomicBool::new(config.create_threads),
            mailbox: Mailbox::from_config(config),
            timers: Mutex::new(TimerList::new()),
            behavior: Mutex::new(behavior),
            handler_thread: Mutex::new(None),
            deferred_stop: AtomicBool::new(false),
            adapter: RwLock::new(None),
            reference: RwLock::new(None),
            registered: AtomicBool::new(false),
            manager: RwLock::new(Weak::new()),
            worker: Mutex::new(None),
            working: Mutex::new(false),
            working_cv: Condvar::new(),
            metrics: ObjectMetrics::default(),
        }))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn state(&self) -> ObjectState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.id, self.ctx.node())
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn metrics(&self) -> &ObjectMetrics {
        &self.metrics
    }

    /// Reference bound in the directory; only present while active
    pub fn reference(&self) -> Option<RemoteReference> {
        self.reference.read().clone()
    }

    /// Owning manager, if still alive
    pub fn manager(&self) -> Option<Arc<Manager>> {
        self.manager.read().upgrade()
    }

    pub(crate) fn set_manager(&self, manager: Weak<Manager>) {
        *self.manager.write() = manager;
    }

    /// Attach the RPC runtime used to expose this object
    pub fn bind_adapter(&self, rpc: Arc<dyn RpcRuntime>) {
        *self.adapter.write() = Some(rpc);
    }

    pub fn adapter(&self) -> Option<Arc<dyn RpcRuntime>> {
        self.adapter.read().clone()
    }

    /// Enable or disable the dedicated worker for the next activation
    pub fn set_thread_creation(&self, enabled: bool) {
        self.create_thread.store(enabled, Ordering::Release);
    }

    /// Whether activation will start a worker thread
    pub fn wants_thread(&self) -> bool {
        !self.id.is_default() && self.create_thread.load(Ordering::Acquire)
    }

    pub fn has_worker(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Queue a message; never blocks, never fails
    pub fn push(&self, msg: impl Into<Arc<Message>>) {
        self.mailbox.push(msg);
    }

    /// Order a timer (zero interval cancels). Returns the effective interval.
    pub fn ask_timer(
        &self,
        timer: TimerId,
        interval: Duration,
        ticks: Option<u32>,
        priority: Priority,
    ) -> Duration {
        let effective = self
            .timers
            .lock()
            .ask(timer, interval, ticks, priority, Instant::now());
        self.mailbox.cancel_wait();
        effective
    }

    pub fn timer_count(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn info(&self) -> ObjectInfo {
        ObjectInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
            threaded: self.has_worker(),
            pending: self.mailbox.len(),
            lost: self.mailbox.lost(),
            capacity: self.mailbox.capacity(),
            messages_processed: self.metrics.messages_processed.load(Ordering::Relaxed),
            handler_failures: self.metrics.handler_failures.load(Ordering::Relaxed),
            queues: self.mailbox.stats(),
        }
    }

    /// Register in the directory and start processing.
    ///
    /// Calling it on an active object is a no-op.
    pub fn activate(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ObjectState::Active => {
                    debug!(object = %self.name, "Already active");
                    return Ok(());
                }
                ObjectState::Registering | ObjectState::Deactivating => {
                    return Err(RuntimeError::invalid_state(
                        self.name.as_str(),
                        *state,
                        "activate",
                    ));
                }
                _ => *state = ObjectState::Registering,
            }
        }

        let started = Instant::now();
        match self.bring_up() {
            Ok(()) => {
                *self.state.lock() = ObjectState::Active;
                self.metrics.activations.fetch_add(1, Ordering::Relaxed);
                info!(
                    object = %self.name,
                    id = %self.id,
                    threaded = self.has_worker(),
                    activation_ms = started.elapsed().as_millis() as u64,
                    "Object activated"
                );
                Ok(())
            }
            Err(e) => {
                self.active.store(false, Ordering::Release);
                self.mailbox.cancel_wait();
                self.wait_finish();
                self.tear_down_registration();
                *self.state.lock() = ObjectState::Error;
                error!(
                    object = %self.name,
                    id = %self.id,
                    error = %e,
                    error_category = e.category(),
                    "Object activation failed"
                );
                Err(e)
            }
        }
    }

    fn bring_up(&self) -> Result<()> {
        if !self.id.is_default() {
            let adapter = self.adapter().ok_or_else(|| {
                RuntimeError::configuration(
                    format!("{} has no RPC adapter bound", self.name),
                    Some("adapter"),
                )
            })?;

            let policy = self.ctx.retry_policy();
            let key = self.key();
            let mode = self.ctx.config().identity_mode;
            let servant: Weak<dyn Servant> = self.self_ref.clone();

            let reference = policy.run("create_reference", |_| {
                adapter.create_reference(servant.clone(), key, &self.name, mode)
            })?;
            *self.reference.write() = Some(reference.clone());

            policy.run("register", |attempt| {
                self.register_once(key, &reference, attempt)
            })?;
            self.registered.store(true, Ordering::Release);
            debug!(object = %self.name, key = %key, handle = reference.handle(), "Registered in directory");
        }

        contain_user(&self.name, "activate_object", || {
            self.behavior.lock().activate_object(self)
        })?;

        self.active.store(true, Ordering::Release);
        if self.wants_thread() {
            self.spawn_worker()?;
        }
        Ok(())
    }

    fn register_once(&self, key: ObjectKey, reference: &RemoteReference, attempt: u32) -> Result<()> {
        let directory = self.ctx.directory();
        match directory.register(key, reference.clone(), false) {
            Err(RuntimeError::RegistrationConflict { .. })
                if self.ctx.config().evict_on_conflict =>
            {
                warn!(
                    object = %self.name,
                    key = %key,
                    attempt,
                    "Name already bound, evicting stale binding"
                );
                match directory.unregister(key) {
                    Ok(()) | Err(RuntimeError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
                directory.register(key, reference.clone(), false)
            }
            other => other,
        }
    }

    /// Leave the directory (if this object still owns the binding) and
    /// release the RPC reference
    fn tear_down_registration(&self) {
        let reference = self.reference.write().take();
        let Some(reference) = reference else {
            return;
        };
        let key = reference.key();

        if self.registered.swap(false, Ordering::AcqRel) {
            let directory = self.ctx.directory();
            let result = self.ctx.retry_policy().run("unregister", |_| {
                match directory.resolve(key) {
                    Ok(bound) if bound == reference => directory.unregister(key),
                    Ok(bound) => {
                        debug!(
                            object = %self.name,
                            key = %key,
                            owner = bound.handle(),
                            "Binding owned by another reference, leaving it"
                        );
                        Ok(())
                    }
                    Err(RuntimeError::NotFound { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            });
            if let Err(e) = result {
                warn!(object = %self.name, key = %key, error = %e, "Failed to unregister");
            }
        }

        if let Some(adapter) = self.adapter() {
            if let Err(e) = adapter.release_reference(&reference) {
                debug!(object = %self.name, error = %e, "Reference release failed");
            }
        }
    }

    fn spawn_worker(&self) -> Result<()> {
        let me = self.self_ref.upgrade().ok_or_else(|| {
            RuntimeError::invalid_state(self.name.as_str(), "dropping", "start worker")
        })?;

        *self.working.lock() = true;
        let spawned = thread::Builder::new()
            .name(format!("obj-{}", self.name))
            .spawn(move || me.run_worker());

        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                *self.working.lock() = false;
                Err(RuntimeError::io(
                    format!("failed to start worker for {}", self.name),
                    e,
                ))
            }
        }
    }

    fn run_worker(self: Arc<Self>) {
        let started = Instant::now();
        info!(object = %self.name, id = %self.id, "Worker started");

        let mut sleep = self.check_timers();
        while self.is_active() {
            if let Some(msg) = self.mailbox.wait(sleep) {
                if !self.is_active() {
                    break;
                }
                self.dispatch(&msg);
            }
            sleep = self.check_timers();
        }

        if self.deferred_stop.swap(false, Ordering::AcqRel) {
            self.finish_deactivation();
        }

        {
            let mut working = self.working.lock();
            *working = false;
            self.working_cv.notify_all();
        }
        info!(
            object = %self.name,
            runtime_ms = started.elapsed().as_millis() as u64,
            "Worker finished"
        );
    }

    /// Push due timer messages and return the sleep until the next deadline
    fn check_timers(&self) -> Option<Duration> {
        let check = self.timers.lock().check(Instant::now());
        for (timer, priority) in check.due {
            self.mailbox.push(
                Message::timer(timer, priority)
                    .to(self.id)
                    .from(self.id, self.ctx.node()),
            );
        }
        check.sleep
    }

    /// Run one message through the matching hook
    fn dispatch(&self, msg: &Message) {
        let operation = match &msg.body {
            MessageBody::Sensor(_) => "sensor_info",
            MessageBody::Timer(_) => "timer_info",
            MessageBody::System(_) => "sys_command",
            MessageBody::Confirm(_) | MessageBody::Other(_) => "other_message",
        };

        let started = Instant::now();
        let result = contain_user(&self.name, operation, || {
            let mut behavior = self.behavior.lock();
            *self.handler_thread.lock() = Some(thread::current().id());
            match &msg.body {
                MessageBody::Sensor(update) => behavior.sensor_info(self, update),
                MessageBody::Timer(timer) => behavior.timer_info(self, timer),
                MessageBody::System(cmd) => behavior.sys_command(self, cmd),
                MessageBody::Confirm(_) | MessageBody::Other(_) => {
                    behavior.other_message(self, msg)
                }
            }
        });
        *self.handler_thread.lock() = None;

        match result {
            Ok(()) => {
                self.metrics.messages_processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    object = %self.name,
                    kind = ?msg.kind(),
                    error = %e,
                    processing_ns = started.elapsed().as_nanos() as u64,
                    "Message handler failed"
                );
            }
        }
    }

    fn in_handler(&self) -> bool {
        *self.handler_thread.lock() == Some(thread::current().id())
    }

    /// Drive an object without a worker: dispatch at most one message and
    /// check timers. Returns whether a message was dispatched.
    pub fn process_pending(&self) -> Result<bool> {
        if self.has_worker() {
            return Err(RuntimeError::invalid_state(
                self.name.as_str(),
                "threaded",
                "process messages synchronously",
            ));
        }

        let dispatched = match self.mailbox.pop() {
            Some(msg) => {
                self.dispatch(&msg);
                true
            }
            None => false,
        };

        if self.deferred_stop.swap(false, Ordering::AcqRel) {
            self.finish_deactivation();
        }
        self.check_timers();
        Ok(dispatched)
    }

    /// Stop processing and leave the directory.
    ///
    /// Idempotent: returns immediately unless the object is active. Called
    /// from inside one of its own hooks, the rest of the shutdown runs as
    /// soon as that hook returns.
    pub fn deactivate(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ObjectState::Active {
                debug!(object = %self.name, state = %*state, "Deactivate ignored");
                return Ok(());
            }
            *state = ObjectState::Deactivating;
        }

        info!(object = %self.name, id = %self.id, "Deactivating object");
        self.active.store(false, Ordering::Release);
        self.mailbox.cancel_wait();

        if self.in_handler() {
            self.deferred_stop.store(true, Ordering::Release);
            debug!(object = %self.name, "Deactivation deferred until the current hook returns");
            return Ok(());
        }

        self.finish_deactivation();
        Ok(())
    }

    fn finish_deactivation(&self) {
        let started = Instant::now();

        if let Err(e) = contain_user(&self.name, "deactivate_object", || {
            self.behavior.lock().deactivate_object(self)
        }) {
            self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
            error!(object = %self.name, error = %e, "Deactivate hook failed");
        }

        self.tear_down_registration();
        self.wait_finish();
        self.timers.lock().clear();

        *self.state.lock() = ObjectState::Stopped;
        info!(
            object = %self.name,
            deactivation_ms = started.elapsed().as_millis() as u64,
            "Object deactivated"
        );
    }

    /// Block until the worker thread has exited and join it
    fn wait_finish(&self) {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            // the worker finishing its own deactivation; the handle is detached
            return;
        }

        {
            let mut working = self.working.lock();
            self.working_cv.wait_while(&mut working, |working| *working);
        }
        if handle.join().is_err() {
            error!(object = %self.name, "Worker thread panicked");
        }
    }

    /// Signal-driven stop: run the `sigterm` hook, then deactivate
    pub fn terminate(&self, signal: Signal) -> Result<()> {
        if self.is_active() {
            if let Err(e) = contain_user(&self.name, "sigterm", || {
                self.behavior.lock().sigterm(self, signal)
            }) {
                self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(object = %self.name, signal = ?signal, error = %e, "Sigterm hook failed");
            }
        }
        self.deactivate()
    }
}

impl Servant for RuntimeObject {
    fn deliver(&self, msg: Message) {
        self.push(msg);
    }

    fn is_reachable(&self) -> bool {
        self.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use plant_config::RuntimeConfig;

    fn ctx() -> RuntimeContext {
        RuntimeContext::local(RuntimeConfig {
            repeat_timeout_ms: 1,
            ..RuntimeConfig::default()
        })
        .unwrap()
    }

    /// Forwards sensor values to the test; fails on negative values
    struct Relay {
        tx: Sender<i64>,
    }

    impl ObjectBehavior for Relay {
        fn sensor_info(&mut self, obj: &RuntimeObject, update: &SensorUpdate) -> anyhow::Result<()> {
            if update.value < 0 {
                anyhow::bail!("negative value on {}", obj.name());
            }
            if update.value == 999 {
                panic!("poisoned value");
            }
            let _ = self.tx.send(update.value);
            Ok(())
        }

        fn timer_info(&mut self, _obj: &RuntimeObject, timer: &TimerFired) -> anyhow::Result<()> {
            let _ = self.tx.send(-timer.timer.into_inner());
            Ok(())
        }
    }

    fn relay(ctx: &RuntimeContext, id: i64) -> (Arc<RuntimeObject>, Receiver<i64>) {
        let (tx, rx) = unbounded();
        let obj = RuntimeObject::new(ctx, ObjectId::new(id), format!("Relay{id}"), Relay { tx }).unwrap();
        obj.bind_adapter(ctx.rpc().clone());
        (obj, rx)
    }

    fn sensor(value: i64) -> Message {
        Message::sensor(SensorUpdate::new(ObjectId::new(1), value))
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = RuntimeObject::new(&ctx(), ObjectId::new(1), "  ", NoopBehavior).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration { .. }));
    }

    #[test]
    fn test_missing_adapter_is_fatal() {
        let ctx = ctx();
        let obj = RuntimeObject::new(&ctx, ObjectId::new(3), "Orphan", NoopBehavior).unwrap();
        let err = obj.activate().unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration { .. }));
        assert_eq!(obj.state(), ObjectState::Error);
        assert!(ctx.directory().list().is_empty());
    }

    #[test]
    fn test_default_identity_runs_without_thread_or_registration() {
        let ctx = ctx();
        let (tx, rx) = unbounded();
        let obj = RuntimeObject::new(&ctx, ObjectId::DEFAULT, "Local", Relay { tx }).unwrap();

        obj.activate().unwrap();
        assert_eq!(obj.state(), ObjectState::Active);
        assert!(!obj.has_worker());
        assert!(obj.reference().is_none());
        assert!(ctx.directory().list().is_empty());

        obj.push(sensor(5));
        assert!(obj.process_pending().unwrap());
        assert!(!obj.process_pending().unwrap());
        assert_eq!(rx.try_recv().unwrap(), 5);

        obj.deactivate().unwrap();
        assert_eq!(obj.state(), ObjectState::Stopped);
    }

    #[test]
    fn test_worker_dispatches_and_contains_failures() {
        let ctx = ctx();
        let (obj, rx) = relay(&ctx, 10);
        obj.activate().unwrap();
        assert!(obj.has_worker());
        assert!(ctx.directory().resolve(obj.key()).is_ok());

        obj.push(sensor(-1));
        obj.push(sensor(999));
        obj.push(sensor(7));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);

        let info = obj.info();
        assert_eq!(info.handler_failures, 2);
        assert!(info.to_string().starts_with("Relay10 (10) state=active"));

        obj.deactivate().unwrap();
        assert_eq!(obj.state(), ObjectState::Stopped);
        assert!(!obj.has_worker());
        assert!(ctx.directory().list().is_empty());
    }

    #[test]
    fn test_process_pending_rejected_for_threaded_object() {
        let ctx = ctx();
        let (obj, _rx) = relay(&ctx, 11);
        obj.activate().unwrap();
        assert!(matches!(
            obj.process_pending(),
            Err(RuntimeError::InvalidState { .. })
        ));
        obj.deactivate().unwrap();
    }

    #[test]
    fn test_timer_fires_on_worker() {
        let ctx = ctx();
        let (obj, rx) = relay(&ctx, 12);
        obj.activate().unwrap();

        obj.ask_timer(TimerId::new(4), Duration::from_millis(20), Some(1), Priority::High);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), -4);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(obj.timer_count(), 0);

        obj.deactivate().unwrap();
    }

    #[test]
    fn test_deactivate_drops_timers() {
        let ctx = ctx();
        let (obj, _rx) = relay(&ctx, 16);
        obj.activate().unwrap();

        obj.ask_timer(TimerId::new(9), Duration::from_secs(60), None, Priority::Low);
        assert_eq!(obj.timer_count(), 1);

        obj.deactivate().unwrap();
        assert_eq!(obj.timer_count(), 0);
    }

    #[test]
    fn test_deactivate_twice_is_noop() {
        let ctx = ctx();
        let (obj, _rx) = relay(&ctx, 13);
        obj.activate().unwrap();
        obj.deactivate().unwrap();

        let started = Instant::now();
        obj.deactivate().unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(obj.state(), ObjectState::Stopped);
    }

    #[test]
    fn test_reactivate_after_stop() {
        let ctx = ctx();
        let (obj, rx) = relay(&ctx, 14);
        obj.activate().unwrap();
        obj.deactivate().unwrap();
        obj.activate().unwrap();

        obj.push(sensor(3));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 3);
        assert_eq!(obj.metrics().activations.load(Ordering::Relaxed), 2);
        obj.deactivate().unwrap();
    }

    #[test]
    fn test_info_serializes() {
        let ctx = ctx();
        let obj = RuntimeObject::new(&ctx, ObjectId::new(16), "Tank", NoopBehavior).unwrap();
        obj.push(sensor(1));

        let json = serde_json::to_value(obj.info()).unwrap();
        assert_eq!(json["name"], "Tank");
        assert_eq!(json["state"], "unregistered");
        assert_eq!(json["pending"], 1);
        assert_eq!(json["queues"].as_array().unwrap().len(), 3);
    }

    struct SelfStopping;

    impl ObjectBehavior for SelfStopping {
        fn sys_command(&mut self, obj: &RuntimeObject, _cmd: &SystemMessage) -> anyhow::Result<()> {
            obj.deactivate()?;
            Ok(())
        }
    }

    #[test]
    fn test_deactivate_from_own_hook() {
        let ctx = ctx();
        let obj = RuntimeObject::new(&ctx, ObjectId::new(15), "Quitter", SelfStopping).unwrap();
        obj.bind_adapter(ctx.rpc().clone());
        obj.activate().unwrap();

        obj.push(Message::system(plant_types::SystemCommand::Finish));

        let deadline = Instant::now() + Duration::from_secs(2);
        while obj.state() != ObjectState::Stopped && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(obj.state(), ObjectState::Stopped);
        assert!(ctx.directory().list().is_empty());
    }
}
