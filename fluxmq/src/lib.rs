//! MQTT session and delivery engine.
//!
//! Builds on [`fluxmq_codec`] and [`fluxmq_net`] to provide the
//! protocol state above the wire: topic filter matching, the QoS 1/2
//! delivery window with retry and redelivery, per-session message
//! queues, session persistence, and the broker- and client-side
//! connection state machines for MQTT 3.1, 3.1.1 and 5.

#![deny(unsafe_code)]

pub mod client;
pub mod delivery;
pub mod inflight;
pub mod queue;
pub mod session;
pub mod sink;
pub mod store;
pub mod topic;
pub mod types;
pub mod v3;
pub mod v5;

pub use client::{Client, ClientHandle, ConnectOptions};
pub use delivery::{Action, DeliveryState, Event};
pub use session::{Handler, SessionRegistry, SessionState};
pub use sink::{Packet, Sink};
pub use store::{MemoryStore, MessageStore, StoreHandle, StoredMessage};
pub use topic::{Topic, TopicError};
pub use types::{ClientId, From, Id, Message, Publish, QoS, Reason, TopicName};

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
