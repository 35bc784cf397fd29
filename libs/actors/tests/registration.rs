//! Directory registration, retry and remote delivery through the public API

use crossbeam_channel::{unbounded, Sender};
use plant_actors::{
    LocalDirectory, LocalRpcRuntime, ObjectBehavior, ObjectState, RemoteDirectory, RpcRuntime,
    RuntimeContext, RuntimeError, RuntimeObject,
};
use plant_config::{IdentityMode, RuntimeConfig};
use plant_types::{Message, ObjectId, SensorUpdate};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Harness {
    ctx: RuntimeContext,
    directory: Arc<LocalDirectory>,
    rpc: Arc<LocalRpcRuntime>,
}

fn harness(config: RuntimeConfig) -> Harness {
    let directory = Arc::new(LocalDirectory::new());
    let rpc = Arc::new(LocalRpcRuntime::new());
    let ctx = RuntimeContext::new(config, directory.clone(), rpc.clone()).unwrap();
    Harness {
        ctx,
        directory,
        rpc,
    }
}

fn fast_retries() -> RuntimeConfig {
    RuntimeConfig {
        repeat_count: 2,
        repeat_timeout_ms: 10,
        ..RuntimeConfig::default()
    }
}

struct Forward(Sender<i64>);

impl ObjectBehavior for Forward {
    fn sensor_info(&mut self, _obj: &RuntimeObject, update: &SensorUpdate) -> anyhow::Result<()> {
        let _ = self.0.send(update.value);
        Ok(())
    }
}

fn object(h: &Harness, id: i64, name: &str) -> Arc<RuntimeObject> {
    let (tx, _rx) = unbounded();
    let obj = RuntimeObject::new(&h.ctx, ObjectId::new(id), name, Forward(tx)).unwrap();
    obj.bind_adapter(h.rpc.clone());
    obj
}

#[test]
fn test_eviction_replaces_stale_binding() {
    let h = harness(fast_retries());
    let stale = object(&h, 5, "PumpOld");
    let fresh = object(&h, 5, "PumpNew");

    stale.activate().unwrap();
    fresh.activate().unwrap();

    let bound = h.directory.resolve(fresh.key()).unwrap();
    assert_eq!(bound.handle(), "PumpNew");

    // the evicted owner must not remove the new binding on its way out
    stale.deactivate().unwrap();
    assert_eq!(h.directory.resolve(fresh.key()).unwrap().handle(), "PumpNew");

    fresh.deactivate().unwrap();
    assert!(h.directory.is_empty());
}

#[test]
fn test_restarted_owner_with_same_name_survives_stale_deactivation() {
    let h = harness(fast_retries());
    assert_eq!(h.ctx.config().identity_mode, IdentityMode::StableName);
    let stale = object(&h, 5, "Pump");
    let fresh = object(&h, 5, "Pump");

    stale.activate().unwrap();
    fresh.activate().unwrap();
    assert_eq!(h.rpc.reference_count(), 2);

    stale.deactivate().unwrap();
    assert_eq!(fresh.state(), ObjectState::Active);

    let fresh_ref = fresh.reference().unwrap();
    assert_eq!(h.directory.resolve(fresh.key()).unwrap(), fresh_ref);
    assert!(fresh_ref.exists());
    assert_eq!(h.rpc.reference_count(), 1);

    fresh.deactivate().unwrap();
    assert!(h.directory.is_empty());
    assert_eq!(h.rpc.reference_count(), 0);
}

#[test]
fn test_conflict_without_eviction_keeps_owner() {
    let h = harness(RuntimeConfig {
        evict_on_conflict: false,
        ..fast_retries()
    });
    let owner = object(&h, 6, "ValveA");
    let intruder = object(&h, 6, "ValveB");

    owner.activate().unwrap();
    let err = intruder.activate().unwrap_err();
    assert!(matches!(err, RuntimeError::RegistrationConflict { .. }));
    assert_eq!(intruder.state(), ObjectState::Error);
    assert_eq!(h.directory.resolve(owner.key()).unwrap().handle(), "ValveA");

    owner.deactivate().unwrap();
}

#[test]
fn test_unreachable_directory_times_out() {
    let h = harness(fast_retries());
    h.directory.set_available(false);
    let obj = object(&h, 7, "Mixer");

    let err = obj.activate().unwrap_err();
    assert!(matches!(err, RuntimeError::Timeout { .. }));
    assert_eq!(obj.state(), ObjectState::Error);
    assert!(!obj.has_worker());
    assert_eq!(h.rpc.reference_count(), 0);

    h.directory.set_available(true);
    obj.activate().unwrap();
    assert_eq!(obj.state(), ObjectState::Active);
    obj.deactivate().unwrap();
}

#[test]
fn test_transient_transport_failure_is_retried() {
    let h = harness(fast_retries());
    h.rpc.fail_next_creates(1);
    let obj = object(&h, 8, "Heater");

    obj.activate().unwrap();
    assert!(h.directory.contains(obj.key()));
    obj.deactivate().unwrap();
}

#[test]
fn test_generated_handles_are_unique() {
    let h = harness(RuntimeConfig {
        identity_mode: IdentityMode::GeneratedHandle,
        ..fast_retries()
    });
    let obj = object(&h, 9, "Fan");

    obj.activate().unwrap();
    let first = obj.reference().unwrap().handle().to_string();
    obj.deactivate().unwrap();
    obj.activate().unwrap();
    let second = obj.reference().unwrap().handle().to_string();
    obj.deactivate().unwrap();

    assert!(first.starts_with("Fan-"));
    assert_ne!(first, second);
}

#[test]
fn test_remote_push_through_dispatch_loop() {
    let h = harness(fast_retries());
    let (tx, rx) = unbounded();
    let obj = RuntimeObject::new(&h.ctx, ObjectId::new(20), "Sensor", Forward(tx)).unwrap();
    obj.bind_adapter(h.rpc.clone());
    obj.activate().unwrap();

    let rpc = h.rpc.clone();
    let dispatch = thread::spawn(move || rpc.run_dispatch_loop());

    let remote = h.directory.resolve(obj.key()).unwrap();
    assert!(remote.exists());
    remote
        .push(Message::sensor(SensorUpdate::new(ObjectId::new(3), 42)).to(obj.id()))
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);

    obj.deactivate().unwrap();
    let err = remote
        .push(Message::sensor(SensorUpdate::new(ObjectId::new(3), 43)))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::TransportUnavailable { .. }));

    h.rpc.destroy();
    dispatch.join().unwrap().unwrap();
    let err = remote
        .push(Message::sensor(SensorUpdate::new(ObjectId::new(3), 44)))
        .unwrap_err();
    assert!(err.is_retryable());
}
