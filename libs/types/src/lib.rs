//! # Plant Types
//!
//! Identifiers and the message model shared by every crate of the object
//! runtime. The runtime core only relies on the fixed message header
//! (consumer, priority, timestamp) and the body kind; everything else in a
//! body is interpreted by the receiving object's handlers.
//!
//! ```rust
//! use plant_types::{Message, ObjectId, Priority, SensorUpdate};
//!
//! let msg = Message::sensor(SensorUpdate::new(ObjectId::new(10), 42))
//!     .to(ObjectId::new(200))
//!     .with_priority(Priority::High);
//! assert_eq!(msg.consumer(), ObjectId::new(200));
//! ```

pub mod identifiers;
pub mod messages;

pub use identifiers::{NodeId, ObjectId, TimerId};
pub use messages::{
    CompactionKey, Confirmation, Message, MessageBody, MessageHeader, MessageKind, OpaquePayload,
    Priority, SensorUpdate, SystemCommand, SystemMessage, TimerFired, Timestamp, ValidationError,
};
