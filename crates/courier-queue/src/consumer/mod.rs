//! Broker consumption
//!
//! This module provides:
//! - [`Broker`] trait for a pull-mode broker channel
//! - [`InMemoryBroker`] for tests and local runs
//! - [`MessageHandler`] and the [`IngestHandler`] that persists inbound messages
//! - [`ConsumerLoop`], which runs deliveries under a concurrency bound
//!
//! # Shutdown
//!
//! ```text
//!   broker close signal ──► observer ──► stop() + cancel units
//!                                           │
//!   close() ──► stop() ──► cancel units ──► broker.close() ──► wait for free slots
//! ```
//!
//! A cancelled unit neither acks nor nacks; the broker redelivers it.

mod broker;
mod handler;
mod memory;
mod pool;

pub use broker::{Broker, BrokerError, Delivery, DeliveryTag, QueueOptions};
pub use handler::{HandlerError, IngestHandler, MessageHandler};
pub use memory::InMemoryBroker;
pub use pool::{ConsumerConfig, ConsumerError, ConsumerLoop, ConsumerState};
