//! Failover configuration and composite URI parsing.
//!
//! A failover transport is described by a composite URI:
//!
//! ```text
//! failover:(tcp://a:61616,tcp://b:61616)?randomize=false&maxReconnectAttempts=3
//! failover:tcp://a:61616,tcp://b:61616
//! ```
//!
//! Options after the closing parenthesis configure the failover transport;
//! `nested.*` options are appended to every child URI.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use activewire_transport_traits::{TransportError, TransportResult};

use crate::backoff::{AttemptLimit, BackoffPolicy};

/// Configuration of a failover transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Pick candidates uniformly at random instead of in list order
    pub randomize: bool,
    /// Keep pre-started backup transports
    pub backup: bool,
    /// Maximum number of backup transports
    pub backup_pool_size: usize,
    /// Fail back to a priority URI as soon as it is reachable
    pub priority_backup: bool,
    /// Extra high-precedence URIs
    pub priority_uris: Vec<Url>,
    /// Retries allowed once the transport has connected at least once
    pub max_reconnect_attempts: AttemptLimit,
    /// Retries allowed before the first successful connect; `None` uses `max_reconnect_attempts`
    pub startup_max_reconnect_attempts: Option<AttemptLimit>,
    /// Delay schedule between attempts
    pub backoff: BackoffPolicy,
    /// Cache sent messages for replay
    pub track_messages: bool,
    /// Maximum number of cached messages
    pub max_cache_size: usize,
    /// How long an application call waits for a connection; `None` waits forever
    pub timeout: Option<Duration>,
    /// Let broker connection-control commands replace the URI list
    pub update_uris_supported: bool,
    /// Honor `reconnect_to` in connection-control commands
    pub reconnect_supported: bool,
    /// Honor `rebalance` in connection-control commands
    pub rebalance_supported: bool,
    /// `start()` waits for the first connect outcome
    pub startup_sync: bool,
    /// Upper bound on a single transport start
    pub connect_timeout: Duration,
    /// How often backups and priority URIs are checked while connected
    pub backup_poll_interval: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            randomize: false,
            backup: false,
            backup_pool_size: 1,
            priority_backup: false,
            priority_uris: Vec::new(),
            max_reconnect_attempts: AttemptLimit::Unlimited,
            startup_max_reconnect_attempts: None,
            backoff: BackoffPolicy::default(),
            track_messages: false,
            max_cache_size: 1024,
            timeout: None,
            update_uris_supported: true,
            reconnect_supported: true,
            rebalance_supported: true,
            startup_sync: false,
            connect_timeout: Duration::from_secs(30),
            backup_poll_interval: Duration::from_secs(1),
        }
    }
}

impl FailoverConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable random candidate selection
    #[must_use]
    pub fn with_randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    /// Enable backups with the given pool size
    #[must_use]
    pub fn with_backup(mut self, pool_size: usize) -> Self {
        self.backup = true;
        self.backup_pool_size = pool_size;
        self
    }

    /// Enable priority failback
    #[must_use]
    pub fn with_priority_backup(mut self, priority_backup: bool) -> Self {
        self.priority_backup = priority_backup;
        self
    }

    /// Set the priority URI list
    #[must_use]
    pub fn with_priority_uris(mut self, uris: Vec<Url>) -> Self {
        self.priority_uris = uris;
        self
    }

    /// Set the steady-state attempt limit
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, limit: AttemptLimit) -> Self {
        self.max_reconnect_attempts = limit;
        self
    }

    /// Set the startup attempt limit
    #[must_use]
    pub fn with_startup_max_reconnect_attempts(mut self, limit: AttemptLimit) -> Self {
        self.startup_max_reconnect_attempts = Some(limit);
        self
    }

    /// Set the backoff policy
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable message caching with the given bound
    #[must_use]
    pub fn with_track_messages(mut self, max_cache_size: usize) -> Self {
        self.track_messages = true;
        self.max_cache_size = max_cache_size;
        self
    }

    /// Set how long application calls wait for a connection
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Make `start()` wait for the first connect outcome
    #[must_use]
    pub fn with_startup_sync(mut self, startup_sync: bool) -> Self {
        self.startup_sync = startup_sync;
        self
    }

    /// Set the per-attempt start timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the backup/priority poll interval
    #[must_use]
    pub fn with_backup_poll_interval(mut self, interval: Duration) -> Self {
        self.backup_poll_interval = interval;
        self
    }

    /// The attempt limit in force for the next reconnect cycle.
    pub fn attempt_limit(&self, first_connection: bool) -> AttemptLimit {
        if first_connection {
            self.startup_max_reconnect_attempts
                .unwrap_or(self.max_reconnect_attempts)
        } else {
            self.max_reconnect_attempts
        }
    }

    /// Whether the reconnect loop keeps backup transports at all.
    pub fn wants_backups(&self) -> bool {
        self.backup || self.priority_backup
    }

    /// Applies one `key=value` option from a composite URI.
    pub fn apply_option(&mut self, key: &str, value: &str) -> TransportResult<()> {
        match key {
            "randomize" => self.randomize = parse_bool(key, value)?,
            "backup" => self.backup = parse_bool(key, value)?,
            "backupPoolSize" => self.backup_pool_size = parse_num(key, value)?,
            "priorityBackup" => self.priority_backup = parse_bool(key, value)?,
            "priorityURIs" => self.priority_uris = parse_uri_list(value)?,
            "maxReconnectAttempts" => {
                self.max_reconnect_attempts = AttemptLimit::from_option(parse_num(key, value)?);
            }
            "startupMaxReconnectAttempts" => {
                self.startup_max_reconnect_attempts =
                    Some(AttemptLimit::from_option(parse_num(key, value)?));
            }
            "initialReconnectDelay" => {
                self.backoff.initial_delay = Duration::from_millis(parse_num(key, value)?);
            }
            "maxReconnectDelay" => {
                self.backoff.max_delay = Duration::from_millis(parse_num(key, value)?);
            }
            "useExponentialBackOff" => self.backoff.exponential = parse_bool(key, value)?,
            "backOffMultiplier" => {
                let multiplier: f64 = parse_num(key, value)?;
                if !multiplier.is_finite() || multiplier < 1.0 {
                    return Err(invalid(key, value));
                }
                self.backoff.multiplier = multiplier;
            }
            "trackMessages" => self.track_messages = parse_bool(key, value)?,
            "maxCacheSize" => self.max_cache_size = parse_num(key, value)?,
            "timeout" => {
                let millis: i64 = parse_num(key, value)?;
                self.timeout = u64::try_from(millis).ok().map(Duration::from_millis);
            }
            "updateURIsSupported" => self.update_uris_supported = parse_bool(key, value)?,
            "reconnectSupported" => self.reconnect_supported = parse_bool(key, value)?,
            "rebalanceSupported" => self.rebalance_supported = parse_bool(key, value)?,
            "startupSync" => self.startup_sync = parse_bool(key, value)?,
            "connectTimeout" => {
                self.connect_timeout = Duration::from_millis(parse_num(key, value)?);
            }
            "backupPollInterval" => {
                self.backup_poll_interval = Duration::from_millis(parse_num(key, value)?);
            }
            _ => {
                return Err(TransportError::ConfigurationError(format!(
                    "unknown failover option '{key}'"
                )));
            }
        }
        Ok(())
    }
}

/// A parsed `failover:` URI.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverUri {
    /// Child URIs, with `nested.*` options applied
    pub uris: Vec<Url>,
    /// Failover options
    pub config: FailoverConfig,
}

impl FailoverUri {
    /// Parses `failover:(u1,u2,...)?opts` or `failover:u1,u2?opts`.
    pub fn parse(input: &str) -> TransportResult<Self> {
        let trimmed = input.trim();
        let rest = strip_scheme(trimmed).ok_or_else(|| TransportError::InvalidUri {
            uri: trimmed.to_string(),
            reason: "expected the failover: scheme".to_string(),
        })?;

        let (list, query) = split_composite(rest).map_err(|reason| TransportError::InvalidUri {
            uri: trimmed.to_string(),
            reason,
        })?;

        let mut config = FailoverConfig::default();
        let mut nested = Vec::new();
        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if let Some(child_key) = key.strip_prefix("nested.") {
                    nested.push((child_key.to_string(), value.into_owned()));
                } else {
                    config.apply_option(&key, &value)?;
                }
            }
        }

        let mut uris = parse_uri_list(list)?;
        if !nested.is_empty() {
            for uri in &mut uris {
                let mut pairs = uri.query_pairs_mut();
                for (key, value) in &nested {
                    pairs.append_pair(key, value);
                }
            }
        }

        Ok(Self { uris, config })
    }
}

fn strip_scheme(input: &str) -> Option<&str> {
    let (scheme, rest) = input.split_once(':')?;
    scheme.eq_ignore_ascii_case("failover").then_some(rest)
}

/// Splits the part after `failover:` into the URI list and the failover query.
fn split_composite(rest: &str) -> Result<(&str, Option<&str>), String> {
    if let Some(inner) = rest.strip_prefix('(') {
        let mut depth = 1usize;
        for (index, ch) in inner.char_indices() {
            match ch {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        let list = &inner[..index];
                        let after = &inner[index + 1..];
                        return match after {
                            "" => Ok((list, None)),
                            _ => after
                                .strip_prefix('?')
                                .map(|query| (list, Some(query)))
                                .ok_or_else(|| format!("unexpected text after ')': {after}")),
                        };
                    }
                }
                _ => {}
            }
        }
        Err("unbalanced parentheses".to_string())
    } else {
        Ok(match rest.split_once('?') {
            Some((list, query)) => (list, Some(query)),
            None => (rest, None),
        })
    }
}

/// Splits a comma separated URI list, ignoring commas inside parentheses.
fn parse_uri_list(list: &str) -> TransportResult<Vec<Url>> {
    let mut uris = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (index, ch) in list.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                push_uri(&mut uris, &list[start..index])?;
                start = index + 1;
            }
            _ => {}
        }
    }
    push_uri(&mut uris, &list[start..])?;
    Ok(uris)
}

fn push_uri(uris: &mut Vec<Url>, text: &str) -> TransportResult<()> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }
    let uri = Url::parse(text).map_err(|e| TransportError::InvalidUri {
        uri: text.to_string(),
        reason: e.to_string(),
    })?;
    uris.push(uri);
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> TransportResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> TransportResult<T> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> TransportError {
    TransportError::ConfigurationError(format!("invalid value '{value}' for failover option '{key}'"))
}
