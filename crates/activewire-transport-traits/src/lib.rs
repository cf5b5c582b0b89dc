//! # ActiveWire Transport Traits
//!
//! Core transport traits and types for the ActiveWire messaging client.
//! This crate provides the foundational abstractions that all transport implementations depend on.
//!
//! ## Overview
//!
//! This crate defines:
//! - **Traits**: [`Transport`], [`TransportListener`], [`TransportFactory`]
//! - **Commands**: [`Command`], [`CommandKind`], [`ConnectionControl`]
//! - **Selection**: [`TransportRegistry`] maps URI schemes to factories
//! - **Errors**: [`TransportError`], [`TransportResult`]
//! - **Metrics**: [`TransportMetrics`], [`AtomicMetrics`]
//!
//! ## Usage
//!
//! Transport implementations should depend on this crate and implement the [`Transport`] trait:
//!
//! ```rust,ignore
//! use activewire_transport_traits::{Transport, TransportFuture, Command};
//!
//! #[derive(Debug)]
//! struct MyTransport { /* ... */ }
//!
//! impl Transport for MyTransport {
//!     fn oneway(&self, command: Command) -> TransportFuture<'_, ()> {
//!         Box::pin(async move { /* ... */ Ok(()) })
//!     }
//!     // ... other trait methods
//! }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

mod command;
mod error;
mod metrics;
mod registry;
mod traits;
mod types;

// Re-export all public items
pub use command::{
    Command, CommandId, CommandIdGenerator, CommandKind, ConnectionControl, TransactionAction,
};
pub use error::{TransportError, TransportResult};
pub use metrics::{AtomicMetrics, TransportMetrics};
pub use registry::TransportRegistry;
pub use traits::{Transport, TransportFactory, TransportFuture, TransportListener, narrow};
pub use types::TransportState;
