//! # ActiveWire Failover Transport
//!
//! A fault-tolerant transport that wraps any number of child transports and
//! presents them as a single connection that survives broker restarts.
//!
//! ## Features
//!
//! - **Reconnect with backoff**: ordered or randomized candidate selection,
//!   exponential delays and separate startup and steady-state attempt limits
//! - **State replay**: connections, sessions, consumers, producers, open
//!   transactions and (optionally) sent messages are resent in order on every
//!   new connection, before any new application traffic
//! - **Backups**: pre-started standby transports, with automatic failback to
//!   priority URIs
//! - **Broker control**: honors reconnect, rebalance and cluster-update
//!   instructions pushed by the broker
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use activewire_failover::FailoverTransport;
//! use activewire_transport_traits::{Transport, TransportRegistry};
//!
//! let transport = FailoverTransport::from_uri(
//!     "failover:(tcp://broker-a:61616,tcp://broker-b:61616)?randomize=false",
//!     Arc::new(registry),
//! )?;
//! transport.set_listener(listener);
//! transport.start().await?;
//! ```
//!
//! ## Options
//!
//! | Option | Default | Meaning |
//! |--------|---------|---------|
//! | `randomize` | `false` | pick candidates at random |
//! | `maxReconnectAttempts` | `-1` | retries after a connection was established (`-1` = forever) |
//! | `startupMaxReconnectAttempts` | unset | retries before the first connection |
//! | `initialReconnectDelay` | `10` | first backoff delay (ms) |
//! | `maxReconnectDelay` | `30000` | backoff cap (ms) |
//! | `useExponentialBackOff` | `true` | grow the delay between attempts |
//! | `backOffMultiplier` | `2.0` | growth factor |
//! | `timeout` | `-1` | how long a send waits for a connection (ms) |
//! | `trackMessages` | `false` | replay cached messages |
//! | `maxCacheSize` | `1024` | cached message limit |
//! | `backup` / `backupPoolSize` | `false` / `1` | standby transports |
//! | `priorityBackup` / `priorityURIs` | `false` / empty | fail back to preferred brokers |
//! | `startupSync` | `false` | `start()` waits for the first connection |
//!
//! `nested.*` options are passed to every child URI.

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

mod backoff;
mod bridge;
mod config;
mod factory;
mod metrics;
mod reconnect;
mod state;
mod tracker;
mod transport;
mod uri_pool;

pub use backoff::{AttemptLimit, BackoffPolicy};
pub use config::{FailoverConfig, FailoverUri};
pub use factory::FailoverTransportFactory;
pub use metrics::{FailoverMetrics, FailoverMetricsSnapshot};
pub use tracker::{CommandTracker, ResponseWaiter, TrackedCommand, is_replayable};
pub use transport::FailoverTransport;
pub use uri_pool::{NextUri, UriPool};
