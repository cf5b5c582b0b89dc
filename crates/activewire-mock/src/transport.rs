//! The `mock://` transport and its factory.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

use activewire_transport_traits::{
    AtomicMetrics, Command, CommandId, Transport, TransportError, TransportFactory, TransportFuture,
    TransportListener, TransportMetrics, TransportResult,
};

use crate::network::{Inbound, MockNetwork, endpoint_name};

type PendingMap = Arc<Mutex<HashMap<CommandId, oneshot::Sender<Command>>>>;

/// Failure-injection options parsed from the mock URI query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockOptions {
    /// `failOnCreate`: the factory refuses to create the transport.
    pub fail_on_create: bool,
    /// `failOnStart`: `start()` fails without contacting the endpoint.
    pub fail_on_start: bool,
    /// `failOnSendMessage`: sends fail once `num_sent_before_fail` commands went out.
    pub fail_on_send: bool,
    /// `numSentMessageBeforeFail`
    pub num_sent_before_fail: u32,
    /// `autoRespond`: answer `response_required` commands with a `Response`.
    pub auto_respond: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            fail_on_create: false,
            fail_on_start: false,
            fail_on_send: false,
            num_sent_before_fail: 0,
            auto_respond: true,
        }
    }
}

impl MockOptions {
    /// Parses the options from `uri`'s query string.
    ///
    /// Unknown keys and malformed values are configuration errors.
    pub fn from_uri(uri: &Url) -> TransportResult<Self> {
        let mut options = Self::default();
        for (key, value) in uri.query_pairs() {
            match key.as_ref() {
                "failOnCreate" => options.fail_on_create = parse_flag(&key, &value)?,
                "failOnStart" => options.fail_on_start = parse_flag(&key, &value)?,
                "failOnSendMessage" => options.fail_on_send = parse_flag(&key, &value)?,
                "autoRespond" => options.auto_respond = parse_flag(&key, &value)?,
                "numSentMessageBeforeFail" => {
                    options.num_sent_before_fail = value.parse().map_err(|_| {
                        TransportError::ConfigurationError(format!(
                            "invalid value '{value}' for mock option {key}"
                        ))
                    })?;
                }
                other => {
                    return Err(TransportError::ConfigurationError(format!(
                        "unknown mock transport option '{other}' in {uri}"
                    )));
                }
            }
        }
        Ok(options)
    }
}

fn parse_flag(key: &str, value: &str) -> TransportResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(TransportError::ConfigurationError(format!(
            "invalid boolean '{value}' for mock option {key}"
        ))),
    }
}

#[derive(Debug)]
struct Live {
    connection_id: u64,
    loopback: mpsc::UnboundedSender<Inbound>,
    dispatch: JoinHandle<()>,
}

/// A transport that talks to an endpoint of a [`MockNetwork`].
///
/// Inbound commands, automatic responses and connection-loss notifications are
/// delivered on a dedicated dispatch task in the order they were produced.
pub struct MockTransport {
    uri: Url,
    name: String,
    network: Arc<MockNetwork>,
    options: MockOptions,
    listener: Arc<RwLock<Option<Arc<dyn TransportListener>>>>,
    live: Mutex<Option<Live>>,
    connected: Arc<AtomicBool>,
    sent: AtomicU32,
    pending: PendingMap,
    metrics: Arc<AtomicMetrics>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("uri", &self.uri.as_str())
            .field("options", &self.options)
            .field("connected", &self.connected.load(Ordering::Acquire))
            .finish()
    }
}

impl MockTransport {
    fn new(uri: Url, network: Arc<MockNetwork>, options: MockOptions) -> Self {
        let name = endpoint_name(&uri);
        Self {
            uri,
            name,
            network,
            options,
            listener: Arc::new(RwLock::new(None)),
            live: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            sent: AtomicU32::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(AtomicMetrics::new()),
        }
    }

    /// The endpoint name this transport connects to.
    pub fn endpoint(&self) -> &str {
        &self.name
    }

    /// The options this transport was created with.
    pub fn options(&self) -> &MockOptions {
        &self.options
    }

    fn spawn_dispatch(&self, mut inbound: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        let listener = Arc::clone(&self.listener);
        let pending = Arc::clone(&self.pending);
        let connected = Arc::clone(&self.connected);
        let metrics = Arc::clone(&self.metrics);
        let name = self.name.clone();

        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                match event {
                    Inbound::Command(command) => {
                        metrics.record_received(command.size());
                        if let Some(id) = command.correlation_id() {
                            if let Some(waiter) = pending.lock().remove(&id) {
                                let _ = waiter.send(command);
                                continue;
                            }
                        }
                        let current = listener.read().clone();
                        match current {
                            Some(l) => l.on_command(command),
                            None => trace!("mock {} dropped {} (no listener)", name, command),
                        }
                    }
                    Inbound::Exception(error) => {
                        connected.store(false, Ordering::Release);
                        // Waiters see their sender dropped.
                        pending.lock().clear();
                        debug!("mock {} connection lost: {}", name, error);
                        let current = listener.read().clone();
                        if let Some(l) = current {
                            l.on_exception(error);
                        }
                        break;
                    }
                }
            }
        })
    }

    fn break_connection(&self, error: TransportError) {
        let live = self.live.lock();
        if let Some(live) = live.as_ref() {
            self.network.disconnect(&self.name, live.connection_id);
            let _ = live.loopback.send(Inbound::Exception(error));
        }
    }
}

impl Transport for MockTransport {
    fn start(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.connected.load(Ordering::Acquire) {
                return Ok(());
            }
            self.metrics.record_connect_attempt();
            if self.options.fail_on_start {
                self.metrics.record_connect_failure();
                return Err(TransportError::ConnectionFailed(format!(
                    "mock {} configured to fail on start",
                    self.uri
                )));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let Some(connection_id) = self.network.connect(&self.name, tx.clone()) else {
                self.metrics.record_connect_failure();
                return Err(TransportError::ConnectionFailed(format!(
                    "mock endpoint {} is unavailable",
                    self.name
                )));
            };

            self.connected.store(true, Ordering::Release);
            let dispatch = self.spawn_dispatch(rx);
            *self.live.lock() = Some(Live {
                connection_id,
                loopback: tx,
                dispatch,
            });
            debug!("mock transport connected to {}", self.name);
            Ok(())
        })
    }

    fn stop(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.connected.store(false, Ordering::Release);
            let live = self.live.lock().take();
            if let Some(live) = live {
                self.network.disconnect(&self.name, live.connection_id);
                live.dispatch.abort();
                debug!("mock transport to {} stopped", self.name);
            }
            self.pending.lock().clear();
            Ok(())
        })
    }

    fn oneway(&self, command: Command) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if !self.connected.load(Ordering::Acquire) {
                return Err(TransportError::NotConnected);
            }

            if self.options.fail_on_send
                && self.sent.load(Ordering::Relaxed) >= self.options.num_sent_before_fail
            {
                warn!("mock {} injecting send failure for {}", self.name, command);
                let error = TransportError::SendFailed(format!(
                    "mock {} configured to fail after {} command(s)",
                    self.name, self.options.num_sent_before_fail
                ));
                self.break_connection(error.clone());
                return Err(error);
            }

            let (connection_id, loopback) = {
                let live = self.live.lock();
                match live.as_ref() {
                    Some(live) => (live.connection_id, live.loopback.clone()),
                    None => return Err(TransportError::NotConnected),
                }
            };

            let size = command.size();
            let answer = (self.options.auto_respond
                && command.response_required
                && !command.is_response())
            .then(|| Command::response_to(command.command_id));

            if !self.network.deliver(&self.name, connection_id, command) {
                return Err(TransportError::ConnectionLost(format!(
                    "mock endpoint {} closed the connection",
                    self.name
                )));
            }
            self.sent.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_sent(size);

            if let Some(response) = answer {
                let _ = loopback.send(Inbound::Command(response));
            }
            Ok(())
        })
    }

    fn request(&self, command: Command, timeout: Option<Duration>) -> TransportFuture<'_, Command> {
        Box::pin(async move {
            let command = command.with_response_required();
            let id = command.command_id;
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(id, tx);

            let started = Instant::now();
            if let Err(e) = self.oneway(command).await {
                self.pending.lock().remove(&id);
                return Err(e);
            }

            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.pending.lock().remove(&id);
                        return Err(TransportError::RequestTimeout {
                            command_id: id,
                            timeout: limit,
                        });
                    }
                },
                None => rx.await,
            };

            let response = outcome.map_err(|_| {
                TransportError::ConnectionLost(format!("mock {} closed before responding", self.name))
            })?;
            self.metrics
                .update_latency_us(u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX));
            Ok(response)
        })
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.write() = Some(listener);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn remote_address(&self) -> Option<String> {
        Some(self.uri.to_string())
    }

    fn metrics(&self) -> TransportMetrics {
        self.metrics.snapshot()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        if let Some(live) = self.live.get_mut().take() {
            self.network.disconnect(&self.name, live.connection_id);
            live.dispatch.abort();
        }
    }
}

/// Creates [`MockTransport`]s for `mock://` URIs on one [`MockNetwork`].
#[derive(Debug, Clone)]
pub struct MockTransportFactory {
    network: Arc<MockNetwork>,
}

impl MockTransportFactory {
    /// Creates a factory bound to `network`.
    pub fn new(network: Arc<MockNetwork>) -> Self {
        Self { network }
    }

    /// The network this factory connects to.
    pub fn network(&self) -> &Arc<MockNetwork> {
        &self.network
    }
}

impl TransportFactory for MockTransportFactory {
    fn scheme(&self) -> &str {
        "mock"
    }

    fn create(&self, uri: &Url) -> TransportResult<Arc<dyn Transport>> {
        let name = endpoint_name(uri);
        self.network.record_create(&name);

        let options = MockOptions::from_uri(uri)?;
        if options.fail_on_create {
            return Err(TransportError::ConnectionFailed(format!(
                "mock {uri} configured to fail on create"
            )));
        }
        Ok(Arc::new(MockTransport::new(uri.clone(), Arc::clone(&self.network), options)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_options() {
        let options = MockOptions::from_uri(&Url::parse("mock://a").unwrap()).unwrap();
        assert_eq!(options, MockOptions::default());
        assert!(options.auto_respond);
    }

    #[test]
    fn test_parse_options() {
        let uri = Url::parse("mock://a?failOnSendMessage=true&numSentMessageBeforeFail=3&autoRespond=false").unwrap();
        let options = MockOptions::from_uri(&uri).unwrap();
        assert!(options.fail_on_send);
        assert_eq!(options.num_sent_before_fail, 3);
        assert!(!options.auto_respond);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let uri = Url::parse("mock://a?bogus=1").unwrap();
        assert!(matches!(
            MockOptions::from_uri(&uri),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_bad_flag_rejected() {
        let uri = Url::parse("mock://a?failOnStart=maybe").unwrap();
        assert!(MockOptions::from_uri(&uri).is_err());
    }

    #[test]
    fn test_fail_on_create_still_counted() {
        let network = MockNetwork::new();
        let factory = MockTransportFactory::new(Arc::clone(&network));
        let uri = Url::parse("mock://a?failOnCreate=true").unwrap();
        assert!(factory.create(&uri).is_err());
        assert_eq!(network.create_count("a"), 1);
    }
}
