//! Discover devices, open framed protocol sessions to them and keep those
//! sessions alive.
//!
//! Hint producers in [`discovery`] report endpoints. The
//! [`registry::ConnectionRegistry`] offers each hint to the consumers in its
//! blueprint; the first that accepts it configures a transport, and its
//! [`factory::TransportFactory`] assembles a [`connection::Connection`] with
//! a packet [`pipeline`], delivery and query managers, and heartbeat
//! supervision.

pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod deliverability;
pub mod device;
pub mod discovery;
pub mod error;
pub mod factory;
pub mod heartbeat;
pub mod hint;
pub mod metadata;
pub mod pipeline;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod tracing;
pub mod transport;
pub mod type_cache;
