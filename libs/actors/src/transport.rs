//! RPC Runtime Abstraction
//!
//! An object becomes network-addressable by handing itself (as a
//! [`Servant`]) to an [`RpcRuntime`], which returns a [`RemoteReference`].
//! References are what the remote directory stores; pushing through one
//! queues a request that the runtime's dispatch loop delivers to the
//! servant.
//!
//! [`LocalRpcRuntime`] implements the runtime in-process on top of a
//! crossbeam request channel. Wire format and transport are the runtime's
//! business; the object core only uses the operations of the trait.

use crate::error::{Result, RuntimeError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use plant_config::IdentityMode;
use plant_types::{Message, NodeId, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Directory key: object identity on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub id: ObjectId,
    pub node: NodeId,
}

impl ObjectKey {
    pub fn new(id: ObjectId, node: NodeId) -> Self {
        Self { id, node }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.into_inner(), self.node.into_inner())
    }
}

/// Receiver side of remote calls
pub trait Servant: Send + Sync {
    /// Queue a message for the servant's own processing
    fn deliver(&self, msg: Message);

    /// Whether the servant currently accepts remote calls
    fn is_reachable(&self) -> bool;
}

/// Request queued for the dispatch loop
enum Request {
    Push {
        target: Weak<dyn Servant>,
        handle: Arc<str>,
        msg: Message,
    },
    Shutdown,
}

/// Handle bound in the remote directory for one active object
#[derive(Clone)]
pub struct RemoteReference {
    key: ObjectKey,
    handle: Arc<str>,
    /// Unique per `create_reference` call; two exposures of the same
    /// stable name differ here
    serial: u64,
    target: Weak<dyn Servant>,
    requests: Sender<Request>,
    accepting: Arc<AtomicBool>,
}

impl fmt::Debug for RemoteReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteReference")
            .field("key", &self.key)
            .field("handle", &self.handle)
            .field("serial", &self.serial)
            .field("target_alive", &(self.target.strong_count() > 0))
            .finish()
    }
}

impl PartialEq for RemoteReference {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial && self.key == other.key
    }
}

impl Eq for RemoteReference {}

impl RemoteReference {
    pub fn key(&self) -> ObjectKey {
        self.key
    }

    /// Transport identity: the object name in stable mode, a generated
    /// handle otherwise
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Whether the referenced object is alive and reachable right now
    pub fn exists(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
            && self
                .target
                .upgrade()
                .map(|s| s.is_reachable())
                .unwrap_or(false)
    }

    /// Deliver `msg` to the referenced object through the dispatch loop
    pub fn push(&self, msg: Message) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(RuntimeError::transport_unavailable(format!(
                "RPC runtime no longer accepts requests for {}",
                self.key
            )));
        }
        if !self.exists() {
            return Err(RuntimeError::transport_unavailable(format!(
                "object {} ({}) is not reachable",
                self.key, self.handle
            )));
        }

        self.requests
            .send(Request::Push {
                target: self.target.clone(),
                handle: Arc::clone(&self.handle),
                msg,
            })
            .map_err(|_| RuntimeError::transport_unavailable("RPC request channel closed"))
    }
}

/// Operations the object core needs from an RPC/middleware layer
pub trait RpcRuntime: Send + Sync {
    /// Expose `servant` and return a reference to it
    fn create_reference(
        &self,
        servant: Weak<dyn Servant>,
        key: ObjectKey,
        name: &str,
        mode: IdentityMode,
    ) -> Result<RemoteReference>;

    /// Withdraw a reference created by this runtime
    fn release_reference(&self, reference: &RemoteReference) -> Result<()>;

    /// Serve requests until the runtime is destroyed
    fn run_dispatch_loop(&self) -> Result<()>;

    /// Reject every request from now on
    fn stop_accepting_requests(&self);

    /// Tear down the runtime and end the dispatch loop
    fn destroy(&self);

    fn is_accepting(&self) -> bool;
}

/// Dispatch statistics
#[derive(Debug, Default)]
pub struct RpcMetrics {
    pub references_created: AtomicU64,
    pub references_released: AtomicU64,
    pub requests_dispatched: AtomicU64,
    /// Requests whose target was gone at dispatch time
    pub requests_orphaned: AtomicU64,
}

/// In-process RPC runtime
pub struct LocalRpcRuntime {
    sender: Sender<Request>,
    receiver: Receiver<Request>,
    accepting: Arc<AtomicBool>,
    destroyed: AtomicBool,
    /// Live exposures by reference serial
    references: RwLock<HashMap<u64, (Arc<str>, ObjectKey)>>,
    next_serial: AtomicU64,
    /// Upcoming `create_reference` calls that fail as unavailable
    injected_failures: AtomicU32,
    metrics: RpcMetrics,
}

impl fmt::Debug for LocalRpcRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRpcRuntime")
            .field("accepting", &self.is_accepting())
            .field("destroyed", &self.destroyed.load(Ordering::Acquire))
            .field("references", &self.references.read().len())
            .finish()
    }
}

const DISPATCH_POLL: Duration = Duration::from_millis(100);

impl LocalRpcRuntime {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            accepting: Arc::new(AtomicBool::new(true)),
            destroyed: AtomicBool::new(false),
            references: RwLock::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            injected_failures: AtomicU32::new(0),
            metrics: RpcMetrics::default(),
        }
    }

    /// Make the next `count` reference creations fail as unavailable
    pub fn fail_next_creates(&self, count: u32) {
        self.injected_failures.store(count, Ordering::Release);
    }

    pub fn metrics(&self) -> &RpcMetrics {
        &self.metrics
    }

    pub fn reference_count(&self) -> usize {
        self.references.read().len()
    }

    /// Live exposures under `handle`
    pub fn exposures_of(&self, handle: &str) -> usize {
        self.references
            .read()
            .values()
            .filter(|(h, _)| h.as_ref() == handle)
            .count()
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn dispatch(&self, target: Weak<dyn Servant>, handle: &str, msg: Message) {
        match target.upgrade() {
            Some(servant) if servant.is_reachable() => {
                trace!(handle, kind = ?msg.kind(), "Dispatching remote push");
                servant.deliver(msg);
                self.metrics.requests_dispatched.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                debug!(handle, "Dropping request for unreachable object");
                self.metrics.requests_orphaned.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Default for LocalRpcRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcRuntime for LocalRpcRuntime {
    fn create_reference(
        &self,
        servant: Weak<dyn Servant>,
        key: ObjectKey,
        name: &str,
        mode: IdentityMode,
    ) -> Result<RemoteReference> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(RuntimeError::transport_unavailable("RPC runtime destroyed"));
        }
        if self.take_injected_failure() {
            return Err(RuntimeError::transport_unavailable(format!(
                "reference creation for {name} failed"
            )));
        }

        let handle: Arc<str> = match mode {
            IdentityMode::StableName => Arc::from(name),
            IdentityMode::GeneratedHandle => {
                Arc::from(format!("{}-{}", name, Uuid::new_v4().simple()))
            }
        };

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let shared = self.exposures_of(&handle);
        if shared > 0 {
            debug!(handle = %handle, serial, shared, "Stable name already exposed");
        }
        self.references
            .write()
            .insert(serial, (Arc::clone(&handle), key));
        self.metrics.references_created.fetch_add(1, Ordering::Relaxed);

        Ok(RemoteReference {
            key,
            handle,
            serial,
            target: servant,
            requests: self.sender.clone(),
            accepting: Arc::clone(&self.accepting),
        })
    }

    fn release_reference(&self, reference: &RemoteReference) -> Result<()> {
        match self.references.write().remove(&reference.serial) {
            Some(_) => {
                self.metrics.references_released.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(RuntimeError::not_found(reference.handle())),
        }
    }

    fn run_dispatch_loop(&self) -> Result<()> {
        info!("RPC dispatch loop started");
        loop {
            match self.receiver.recv_timeout(DISPATCH_POLL) {
                Ok(Request::Push {
                    target,
                    handle,
                    msg,
                }) => self.dispatch(target, &handle, msg),
                Ok(Request::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if self.destroyed.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(
            dispatched = self.metrics.requests_dispatched.load(Ordering::Relaxed),
            "RPC dispatch loop finished"
        );
        Ok(())
    }

    fn stop_accepting_requests(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!("RPC runtime stopped accepting requests");
        }
    }

    fn destroy(&self) {
        self.stop_accepting_requests();
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let leaked = self.references.read().len();
        if leaked > 0 {
            warn!(references = leaked, "RPC runtime destroyed with live references");
        }
        self.references.write().clear();
        let _ = self.sender.send(Request::Shutdown);
        info!("RPC runtime destroyed");
    }

    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<Message>>,
        reachable: AtomicBool,
    }

    impl Servant for Recorder {
        fn deliver(&self, msg: Message) {
            self.received.lock().push(msg);
        }

        fn is_reachable(&self) -> bool {
            self.reachable.load(Ordering::Acquire)
        }
    }

    fn servant() -> (Arc<Recorder>, Weak<dyn Servant>) {
        let recorder = Arc::new(Recorder::default());
        recorder.reachable.store(true, Ordering::Release);
        let as_servant: Arc<dyn Servant> = recorder.clone();
        let weak = Arc::downgrade(&as_servant);
        (recorder, weak)
    }

    fn key(id: i64) -> ObjectKey {
        ObjectKey::new(ObjectId::new(id), NodeId::new(0))
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key(12).to_string(), "12@0");
    }

    #[test]
    fn test_identity_modes() {
        let rpc = LocalRpcRuntime::new();
        let (_recorder, weak) = servant();

        let stable = rpc
            .create_reference(weak.clone(), key(1), "Pump1", IdentityMode::StableName)
            .unwrap();
        assert_eq!(stable.handle(), "Pump1");

        let generated = rpc
            .create_reference(weak, key(1), "Pump1", IdentityMode::GeneratedHandle)
            .unwrap();
        assert!(generated.handle().starts_with("Pump1-"));
        assert_ne!(stable, generated);
        assert_eq!(rpc.reference_count(), 2);
    }

    #[test]
    fn test_release_keeps_other_exposures_of_same_name() {
        let rpc = LocalRpcRuntime::new();
        let (_old, old_weak) = servant();
        let (_new, new_weak) = servant();

        let old = rpc
            .create_reference(old_weak, key(3), "Pump", IdentityMode::StableName)
            .unwrap();
        let new = rpc
            .create_reference(new_weak, key(3), "Pump", IdentityMode::StableName)
            .unwrap();
        assert_eq!(old.handle(), new.handle());
        assert_ne!(old, new);
        assert_eq!(rpc.exposures_of("Pump"), 2);

        rpc.release_reference(&old).unwrap();
        assert_eq!(rpc.reference_count(), 1);
        assert!(new.exists());
        rpc.release_reference(&new).unwrap();
        assert_eq!(rpc.reference_count(), 0);
    }

    #[test]
    fn test_push_through_dispatch_loop() {
        let rpc = Arc::new(LocalRpcRuntime::new());
        let (recorder, weak) = servant();
        let reference = rpc
            .create_reference(weak, key(1), "Valve", IdentityMode::StableName)
            .unwrap();

        let loop_handle = {
            let rpc = Arc::clone(&rpc);
            thread::spawn(move || rpc.run_dispatch_loop())
        };

        reference.push(Message::other(1, vec![1u8, 2, 3])).unwrap();
        rpc.destroy();
        loop_handle.join().unwrap().unwrap();

        // the push was queued before the shutdown request
        assert_eq!(recorder.received.lock().len(), 1);
    }

    #[test]
    fn test_push_rejected_after_stop() {
        let rpc = LocalRpcRuntime::new();
        let (_recorder, weak) = servant();
        let reference = rpc
            .create_reference(weak, key(1), "Valve", IdentityMode::StableName)
            .unwrap();

        rpc.stop_accepting_requests();
        let err = reference.push(Message::other(1, vec![0u8])).unwrap_err();
        assert!(matches!(err, RuntimeError::TransportUnavailable { .. }));
    }

    #[test]
    fn test_push_rejected_when_target_gone() {
        let rpc = LocalRpcRuntime::new();
        let (recorder, weak) = servant();
        let reference = rpc
            .create_reference(weak, key(1), "Valve", IdentityMode::StableName)
            .unwrap();

        drop(recorder);
        assert!(!reference.exists());
        assert!(reference.push(Message::other(1, vec![0u8])).is_err());
    }

    #[test]
    fn test_injected_failures_and_release() {
        let rpc = LocalRpcRuntime::new();
        let (_recorder, weak) = servant();
        rpc.fail_next_creates(1);

        assert!(rpc
            .create_reference(weak.clone(), key(1), "A", IdentityMode::StableName)
            .unwrap_err()
            .is_retryable());

        let reference = rpc
            .create_reference(weak, key(1), "A", IdentityMode::StableName)
            .unwrap();
        rpc.release_reference(&reference).unwrap();
        assert!(rpc.release_reference(&reference).is_err());
    }

    #[test]
    fn test_create_after_destroy_fails() {
        let rpc = LocalRpcRuntime::new();
        rpc.destroy();
        let (_recorder, weak) = servant();
        assert!(rpc
            .create_reference(weak, key(1), "A", IdentityMode::StableName)
            .is_err());
        // dispatch loop returns immediately once destroyed
        rpc.run_dispatch_loop().unwrap();
    }
}
