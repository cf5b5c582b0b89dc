//! # ActiveWire TCP Transport
//!
//! Client-side `tcp://host:port` transport for ActiveWire.
//! Commands are exchanged as newline-delimited JSON, one command per line.
//!
//! ## Features
//!
//! - **Message Framing**: `LinesCodec` with a bounded frame length
//! - **Backpressure Handling**: a bounded outgoing queue feeds a dedicated writer task
//! - **Request Correlation**: responses are matched to pending requests by command id
//! - **Connect Timeout**: `connectionTimeout` bounds socket establishment
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use activewire_tcp::TcpTransportFactory;
//! use activewire_transport_traits::{Transport, TransportRegistry};
//! use url::Url;
//!
//! let registry = TransportRegistry::new().with_factory(Arc::new(TcpTransportFactory::new()));
//! let transport = registry.create(&Url::parse("tcp://localhost:61616?connectionTimeout=5000")?)?;
//! transport.set_listener(listener);
//! transport.start().await?;
//! ```
//!
//! Wrapped in a failover URI (`failover:(tcp://a:61616,tcp://b:61616)`), the
//! transport is recreated on every reconnect attempt.

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

mod transport;

pub use transport::{DEFAULT_MAX_FRAME_LENGTH, TcpConfig, TcpTransport, TcpTransportFactory};

// Re-export transport traits for convenience
pub use activewire_transport_traits::{
    Transport, TransportError, TransportMetrics, TransportResult,
};
