//! # Plant Actors
//!
//! Thread-per-object runtime for industrial I/O processes.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────────┐
//!   signals ──────▶│        ProcessRuntime        │── RPC dispatch loop
//!                  └──────────────┬───────────────┘
//!                                 │ activate / terminate
//!                  ┌──────────────▼───────────────┐
//!                  │        Manager (root)        │
//!                  └───────┬──────────────┬───────┘
//!                          │              │
//!               ┌──────────▼───┐   ┌──────▼───────┐
//!               │ RuntimeObject│   │   Manager    │── ...
//!               │  mailbox     │   └──────────────┘
//!               │  timers      │
//!               │  worker      │◀── RemoteReference::push
//!               └──────────────┘
//! ```
//!
//! Every object owns a three-class priority mailbox with lossy compaction,
//! registers itself in a [`RemoteDirectory`] while active and, when it has a
//! real identity, processes its messages on a dedicated worker thread.
//!
//! # Example
//!
//! ```rust,no_run
//! use plant_actors::{Manager, NoopBehavior, ProcessRuntime, RuntimeContext};
//! use plant_config::RuntimeConfig;
//! use plant_types::ObjectId;
//!
//! let ctx = RuntimeContext::local(RuntimeConfig::default()).unwrap();
//! let root = Manager::new(&ctx, ObjectId::new(1), "Root", NoopBehavior).unwrap();
//! let runtime = ProcessRuntime::new(ctx, root);
//! runtime.run(true).unwrap();
//! runtime.join();
//! ```

pub mod activator;
pub mod context;
pub mod error;
pub mod mailbox;
pub mod manager;
pub mod object;
pub mod registry;
pub mod retry;
pub mod signals;
pub mod timers;
pub mod transport;

pub use activator::{ProcessRuntime, TermPhase};
pub use context::RuntimeContext;
pub use error::{Result, RuntimeError};
pub use mailbox::{Mailbox, MessageQueue, PushOutcome, QueueStats};
pub use manager::Manager;
pub use object::{NoopBehavior, ObjectBehavior, ObjectInfo, ObjectMetrics, ObjectState, RuntimeObject};
pub use registry::{LocalDirectory, RemoteDirectory};
pub use retry::RetryPolicy;
pub use signals::{spawn_signal_listener, OsProcess, ProcessControl, SignalListener, TERMINATION_SIGNALS};
pub use timers::{TimerCheck, TimerList, MIN_QUANTUM};
pub use transport::{LocalRpcRuntime, ObjectKey, RemoteReference, RpcMetrics, RpcRuntime, Servant};

pub use nix::sys::signal::Signal;
