//! TCP transport implementation

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};
use url::Url;

use activewire_transport_traits::{
    AtomicMetrics, Command, CommandId, Transport, TransportError, TransportFactory, TransportFuture,
    TransportListener, TransportMetrics, TransportResult,
};

/// Largest accepted frame (1MB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Per-connection settings, parsed from the `tcp://` URI query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    /// `connectionTimeout` (ms): bound on establishing the socket
    pub connection_timeout: Duration,
    /// `maxFrameLength`: longest accepted inbound line, in bytes
    pub max_frame_length: usize,
    /// `tcpNoDelay`: disable Nagle's algorithm
    pub tcp_no_delay: bool,
    /// `sendBufferCommands`: outgoing queue capacity
    pub send_buffer: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            tcp_no_delay: true,
            send_buffer: 100,
        }
    }
}

impl TcpConfig {
    /// Parses the options in `uri`'s query; unknown keys are rejected.
    pub fn from_uri(uri: &Url) -> TransportResult<Self> {
        let mut config = Self::default();
        for (key, value) in uri.query_pairs() {
            match key.as_ref() {
                "connectionTimeout" => {
                    config.connection_timeout = Duration::from_millis(parse_option(&key, &value)?);
                }
                "maxFrameLength" => config.max_frame_length = parse_option(&key, &value)?,
                "tcpNoDelay" => config.tcp_no_delay = parse_option(&key, &value)?,
                "sendBufferCommands" => {
                    config.send_buffer = parse_option(&key, &value)?;
                    if config.send_buffer == 0 {
                        return Err(TransportError::ConfigurationError(
                            "sendBufferCommands must be at least 1".into(),
                        ));
                    }
                }
                other => {
                    return Err(TransportError::ConfigurationError(format!(
                        "unknown tcp transport option '{other}' in {uri}"
                    )));
                }
            }
        }
        Ok(config)
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> TransportResult<T> {
    value.parse().map_err(|_| {
        TransportError::ConfigurationError(format!("invalid value '{value}' for tcp option {key}"))
    })
}

/// The `host:port` a `tcp://` URI addresses.
fn socket_target(uri: &Url) -> TransportResult<String> {
    let invalid = |reason: &str| TransportError::InvalidUri {
        uri: uri.to_string(),
        reason: reason.to_string(),
    };
    let host = uri.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = uri.port().ok_or_else(|| invalid("missing port"))?;
    Ok(format!("{host}:{port}"))
}

/// State shared between the transport and its reader and writer tasks.
struct Link {
    addr: String,
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    connected: AtomicBool,
    pending: DashMap<CommandId, oneshot::Sender<Command>>,
    metrics: AtomicMetrics,
}

impl Link {
    /// Marks the connection dead and reports `error` once.
    fn fail(&self, error: TransportError) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        // Waiters see their sender dropped.
        self.pending.clear();
        warn!("TCP connection to {} lost: {}", self.addr, error);
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_exception(error);
        }
    }

    fn dispatch(&self, command: Command) {
        if let Some(id) = command.correlation_id() {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(command);
                return;
            }
        }
        let listener = self.listener.read().clone();
        match listener {
            Some(listener) => listener.on_command(command),
            None => debug!("No listener on {}, dropping {}", self.addr, command),
        }
    }
}

#[derive(Debug)]
struct Live {
    outgoing: mpsc::Sender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    peer: Option<SocketAddr>,
}

/// A client connection to one broker, exchanging commands as JSON lines.
pub struct TcpTransport {
    uri: Url,
    config: TcpConfig,
    link: Arc<Link>,
    live: Mutex<Option<Live>>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("uri", &self.uri.as_str())
            .field("config", &self.config)
            .field("connected", &self.link.connected.load(Ordering::Acquire))
            .field("metrics", &self.link.metrics)
            .finish()
    }
}

impl TcpTransport {
    /// Creates an unconnected transport for a `tcp://host:port` URI.
    pub fn new(uri: Url) -> TransportResult<Self> {
        let addr = socket_target(&uri)?;
        let config = TcpConfig::from_uri(&uri)?;
        Ok(Self {
            uri,
            config,
            link: Arc::new(Link {
                addr,
                listener: RwLock::new(None),
                connected: AtomicBool::new(false),
                pending: DashMap::new(),
                metrics: AtomicMetrics::new(),
            }),
            live: Mutex::new(None),
        })
    }

    /// The settings parsed from the URI.
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    async fn connect_stream(&self) -> TransportResult<TcpStream> {
        let addr = self.link.addr.as_str();
        match tokio::time::timeout(self.config.connection_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TransportError::ConnectionFailed(format!(
                "Failed to connect to TCP endpoint {addr}: {e}"
            ))),
            Err(_) => Err(TransportError::ConnectionTimeout {
                uri: self.uri.to_string(),
                timeout: self.config.connection_timeout,
            }),
        }
    }
}

/// Drains the outgoing queue into the socket.
async fn write_frames<S>(link: Arc<Link>, mut sink: S, mut outgoing: mpsc::Receiver<String>)
where
    S: futures::Sink<String, Error = LinesCodecError> + Unpin,
{
    while let Some(line) = outgoing.recv().await {
        if let Err(e) = sink.send(line).await {
            error!("Failed to write to TCP connection {}: {}", link.addr, e);
            link.fail(TransportError::ConnectionLost(format!("write failed: {e}")));
            return;
        }
    }
    let _ = sink.close().await;
    debug!("TCP writer for {} finished", link.addr);
}

/// Decodes inbound lines and dispatches them until the connection ends.
async fn read_frames<S>(link: Arc<Link>, mut lines: S)
where
    S: futures::Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    loop {
        match lines.next().await {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Command>(&line) {
                    Ok(command) => {
                        link.metrics.record_received(command.size());
                        link.dispatch(command);
                    }
                    Err(e) => {
                        // Skip invalid frames but keep the connection open
                        warn!("Skipping malformed frame from {}: {}", link.addr, e);
                    }
                }
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                link.fail(TransportError::ProtocolError(format!(
                    "frame from {} exceeds the maximum length",
                    link.addr
                )));
                return;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                link.fail(TransportError::ConnectionLost(e.to_string()));
                return;
            }
            None => {
                link.fail(TransportError::ConnectionLost(format!(
                    "{} closed the connection",
                    link.addr
                )));
                return;
            }
        }
    }
}

impl Transport for TcpTransport {
    fn start(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.link.connected.load(Ordering::Acquire) {
                return Ok(());
            }
            info!("Connecting to TCP endpoint {}", self.link.addr);
            self.link.metrics.record_connect_attempt();

            let stream = match self.connect_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    self.link.metrics.record_connect_failure();
                    return Err(e);
                }
            };
            if let Err(e) = stream.set_nodelay(self.config.tcp_no_delay) {
                debug!("Could not set TCP_NODELAY on {}: {}", self.link.addr, e);
            }
            let peer = stream.peer_addr().ok();

            let framed = Framed::new(
                stream,
                LinesCodec::new_with_max_length(self.config.max_frame_length),
            );
            let (sink, lines) = framed.split();
            let (outgoing, outgoing_rx) = mpsc::channel(self.config.send_buffer);

            self.link.connected.store(true, Ordering::Release);
            let writer = tokio::spawn(write_frames(Arc::clone(&self.link), sink, outgoing_rx));
            let reader = tokio::spawn(read_frames(Arc::clone(&self.link), lines));
            *self.live.lock() = Some(Live {
                outgoing,
                reader,
                writer,
                peer,
            });
            info!("Connected to TCP endpoint {}", self.link.addr);
            Ok(())
        })
    }

    fn stop(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.link.connected.store(false, Ordering::Release);
            let live = self.live.lock().take();
            if let Some(live) = live {
                live.reader.abort();
                // Closing the queue lets the writer flush what was already accepted.
                drop(live.outgoing);
                if tokio::time::timeout(Duration::from_secs(1), live.writer)
                    .await
                    .is_err()
                {
                    debug!("TCP writer for {} did not finish in time", self.link.addr);
                }
                info!("Disconnected from TCP endpoint {}", self.link.addr);
            }
            self.link.pending.clear();
            Ok(())
        })
    }

    fn oneway(&self, command: Command) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if !self.link.connected.load(Ordering::Acquire) {
                return Err(TransportError::NotConnected);
            }
            let line = serde_json::to_string(&command)
                .map_err(|e| TransportError::SerializationFailed(e.to_string()))?;
            let outgoing = self
                .live
                .lock()
                .as_ref()
                .map(|live| live.outgoing.clone())
                .ok_or(TransportError::NotConnected)?;

            outgoing.send(line).await.map_err(|_| {
                TransportError::ConnectionLost(format!("{} writer has stopped", self.link.addr))
            })?;
            self.link.metrics.record_sent(command.size());
            Ok(())
        })
    }

    fn request(&self, command: Command, timeout: Option<Duration>) -> TransportFuture<'_, Command> {
        Box::pin(async move {
            let command = command.with_response_required();
            let id = command.command_id;
            let (tx, rx) = oneshot::channel();
            self.link.pending.insert(id, tx);

            let started = Instant::now();
            if let Err(e) = self.oneway(command).await {
                self.link.pending.remove(&id);
                return Err(e);
            }

            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        self.link.pending.remove(&id);
                        return Err(TransportError::RequestTimeout {
                            command_id: id,
                            timeout: limit,
                        });
                    }
                },
                None => rx.await,
            };
            let response = outcome.map_err(|_| {
                TransportError::ConnectionLost(format!(
                    "{} closed before responding",
                    self.link.addr
                ))
            })?;
            self.link
                .metrics
                .update_latency_us(u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX));
            Ok(response)
        })
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.link.listener.write() = Some(listener);
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::Acquire)
    }

    fn remote_address(&self) -> Option<String> {
        self.live
            .lock()
            .as_ref()
            .and_then(|live| live.peer)
            .map(|peer| peer.to_string())
    }

    fn metrics(&self) -> TransportMetrics {
        self.link.metrics.snapshot()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(live) = self.live.get_mut().take() {
            live.reader.abort();
            live.writer.abort();
        }
    }
}

/// Factory for `tcp://host:port` URIs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransportFactory;

impl TcpTransportFactory {
    /// Creates the factory.
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for TcpTransportFactory {
    fn scheme(&self) -> &str {
        "tcp"
    }

    fn create(&self, uri: &Url) -> TransportResult<Arc<dyn Transport>> {
        Ok(Arc::new(TcpTransport::new(uri.clone())?))
    }
}
