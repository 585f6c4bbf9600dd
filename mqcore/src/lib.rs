#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust
//! use bytes::Bytes;
//! use mqcore::conf::Settings;
//! use mqcore::context::ServerContext;
//! use mqcore::types::{ClientId, Publish, QoS};
//!
//! let scx = ServerContext::new(Settings::default()).build().unwrap();
//! scx.connect(ClientId::from("c1"));
//! scx.subscribe("c1", "sensors/*", QoS::AtLeastOnce).unwrap();
//!
//! let dispatched = scx.publish(Publish::new("sensors/t1", Bytes::from("21.5"), QoS::AtLeastOnce)).unwrap();
//! let packet_id = dispatched.deliveries[0].packet.packet_id.unwrap().get();
//! scx.acknowledge("c1", packet_id).unwrap();
//! ```

/// Wiring and data flow
pub mod context; // Component container, publish/subscribe/ack flow
pub mod error; // Error types
pub mod logger; // slog set-up and log bridge
pub mod stats; // Runtime statistics

/// Bookkeeping
pub mod message; // Per-client in-flight ledgers
pub mod packet_id; // Numeric packet identifier tables
pub mod queue; // Acknowledgment gate

/// Topic Handling
pub mod retain; // Retained message trie
pub mod router; // Subscription trie
pub mod topic; // Topic segmentation

pub mod types; // Common data types

pub use error::MqError;
pub use mqcore_conf as conf;
pub use mqcore_utils as utils;

pub type Result<T, E = MqError> = std::result::Result<T, E>;
