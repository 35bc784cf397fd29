//! Termination sequence: graceful path, watchdog escalation, inline dispatch

use parking_lot::Mutex;
use plant_actors::{
    Manager, NoopBehavior, ObjectBehavior, ObjectState, ProcessControl, ProcessRuntime,
    RuntimeContext, RuntimeObject, Signal, TermPhase,
};
use plant_config::RuntimeConfig;
use plant_types::ObjectId;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Recording {
    events: Mutex<Vec<String>>,
}

impl Recording {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn wait_for(&self, event: &str, limit: Duration) -> Option<Duration> {
        let started = Instant::now();
        while started.elapsed() < limit {
            if self.events.lock().iter().any(|e| e == event) {
                return Some(started.elapsed());
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }
}

impl ProcessControl for Recording {
    fn restore_default(&self, signal: Signal) -> plant_actors::Result<()> {
        self.events.lock().push(format!("restore {signal:?}"));
        Ok(())
    }

    fn reraise(&self, signal: Signal) -> plant_actors::Result<()> {
        self.events.lock().push(format!("reraise {signal:?}"));
        Ok(())
    }

    fn force_kill(&self) {
        self.events.lock().push("kill".to_string());
    }
}

/// Deactivation that takes longer than the watchdog allows
struct Stuck(Duration);

impl ObjectBehavior for Stuck {
    fn deactivate_object(&mut self, _obj: &RuntimeObject) -> anyhow::Result<()> {
        thread::sleep(self.0);
        Ok(())
    }
}

fn config(terminate_timeout_ms: u64) -> RuntimeConfig {
    RuntimeConfig {
        terminate_timeout_ms,
        handle_signals: false,
        ..RuntimeConfig::default()
    }
}

fn runtime(
    config: RuntimeConfig,
    child: impl ObjectBehavior,
) -> (Arc<ProcessRuntime>, Arc<Recording>, Arc<RuntimeObject>) {
    let ctx = RuntimeContext::local(config).unwrap();
    let root = Manager::new(&ctx, ObjectId::new(1), "Root", NoopBehavior).unwrap();
    let obj = RuntimeObject::new(&ctx, ObjectId::new(2), "Worker", child).unwrap();
    root.add_object(obj.clone()).unwrap();
    let control = Arc::new(Recording::default());
    let rt = ProcessRuntime::with_process_control(ctx, root, control.clone());
    (rt, control, obj)
}

#[test]
fn test_graceful_termination_within_bound() {
    let (rt, control, obj) = runtime(config(2000), NoopBehavior);
    rt.run(true).unwrap();
    assert_eq!(rt.context().directory().list().len(), 2);

    let signaller = {
        let rt = rt.clone();
        thread::spawn(move || rt.handle_signal(Signal::SIGTERM))
    };
    let elapsed = control
        .wait_for("reraise SIGTERM", Duration::from_secs(3))
        .expect("termination did not finish");
    signaller.join().unwrap();

    assert!(elapsed < Duration::from_millis(2000));
    assert_eq!(rt.phase(), TermPhase::Exited);
    assert_eq!(obj.state(), ObjectState::Stopped);
    assert!(rt.context().directory().list().is_empty());
    assert!(!rt.context().rpc().is_accepting());
    assert_eq!(control.events(), vec!["reraise SIGTERM".to_string()]);
}

#[test]
fn test_hung_shutdown_is_force_killed() {
    let (rt, control, _obj) = runtime(config(200), Stuck(Duration::from_millis(1200)));
    rt.run(true).unwrap();

    let started = Instant::now();
    let signaller = {
        let rt = rt.clone();
        thread::spawn(move || rt.handle_signal(Signal::SIGINT))
    };
    control
        .wait_for("kill", Duration::from_secs(1))
        .expect("watchdog did not fire");
    assert!(started.elapsed() < Duration::from_millis(1000));

    let events = control.events();
    assert!(events.contains(&"restore SIGINT".to_string()));
    assert!(events.contains(&"restore SIGTERM".to_string()));

    signaller.join().unwrap();
    assert!(rt.was_forced());
    assert!(!control.events().iter().any(|e| e.starts_with("reraise")));
}

#[test]
fn test_only_first_signal_is_processed() {
    let (rt, control, _obj) = runtime(config(2000), NoopBehavior);
    rt.run(true).unwrap();

    let burst: Vec<_> = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT]
        .into_iter()
        .map(|sig| {
            let rt = rt.clone();
            thread::spawn(move || rt.handle_signal(sig))
        })
        .collect();
    for handle in burst {
        handle.join().unwrap();
    }

    let reraised: Vec<_> = control
        .events()
        .into_iter()
        .filter(|e| e.starts_with("reraise"))
        .collect();
    assert_eq!(reraised.len(), 1);
    assert_eq!(
        reraised[0],
        format!("reraise {:?}", rt.received_signal().unwrap())
    );
}

#[test]
fn test_inline_dispatch_returns_after_shutdown() {
    let (rt, control, obj) = runtime(config(2000), NoopBehavior);

    let runner = {
        let rt = rt.clone();
        thread::spawn(move || rt.run(false))
    };

    let deadline = Instant::now() + Duration::from_secs(2);
    while rt.phase() != TermPhase::Running && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(obj.state(), ObjectState::Active);

    rt.shutdown().unwrap();
    runner.join().unwrap().unwrap();
    rt.join();

    assert_eq!(rt.phase(), TermPhase::Exited);
    assert_eq!(obj.state(), ObjectState::Stopped);
    assert!(control.events().is_empty());
}
