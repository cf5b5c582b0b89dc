//! # ActiveWire Mock Transport
//!
//! An in-process `mock://` transport for exercising fault-tolerant transports
//! without sockets. All transports created by a [`MockTransportFactory`] share
//! one [`MockNetwork`], which records traffic per endpoint and lets a test:
//!
//! - refuse new connections to an endpoint ([`MockNetwork::set_available`])
//! - break live connections ([`MockNetwork::fail_connections`])
//! - push broker commands to connected clients ([`MockNetwork::inject`])
//!
//! Per-transport behavior is controlled through URI options:
//! `failOnCreate`, `failOnStart`, `failOnSendMessage`,
//! `numSentMessageBeforeFail` and `autoRespond`.
//!
//! ```rust,ignore
//! let network = MockNetwork::new();
//! let registry = TransportRegistry::new()
//!     .with_factory(Arc::new(MockTransportFactory::new(Arc::clone(&network))));
//! let transport = registry.create(&Url::parse("mock://broker-a")?)?;
//! transport.start().await?;
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

mod network;
mod transport;

pub use network::MockNetwork;
pub use transport::{MockOptions, MockTransport, MockTransportFactory};
