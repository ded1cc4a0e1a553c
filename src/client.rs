//! Client endpoint: local TCP listeners forwarding over WebSocket.
//!
//! Every accepted TCP connection gets its own [`ClientBridge`], which dials
//! the mapping's WebSocket URL and pumps bytes until one side closes.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::Deserialize;
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::protocol::frame::coding::CloseCode,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::address::{Address, parse_ws_url};
use crate::bridge::{Bridge, BridgeReport, BridgeRole, BridgeState, EventSink};
use crate::error::{BoxError, Result, TunnelError};
use crate::filter::{Filter, FilterChain, FilterSnapshot};
use crate::listener::Listening;
use crate::tls::insecure_client_config;

/// Host the client endpoint binds to when none is configured.
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";

/// Options for dialing the remote WebSocket endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct WsOptions {
    /// Check the server certificate on `wss` URLs.
    #[serde(default = "default_validate_cert")]
    pub validate_cert: bool,
    /// Give up dialing after this many seconds.
    pub connect_timeout_secs: Option<u64>,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            validate_cert: true,
            connect_timeout_secs: None,
        }
    }
}

impl WsOptions {
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}

fn default_validate_cert() -> bool {
    true
}

/// Everything a client bridge needs to reach the remote endpoint.
#[derive(Clone)]
struct DialTarget {
    url: Url,
    connect_timeout: Option<Duration>,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl DialTarget {
    async fn connect(&self) -> std::result::Result<WsConnection, BoxError> {
        let connector = self.tls.as_ref().map(|config| Connector::Rustls(Arc::clone(config)));
        let dial = connect_async_tls_with_config(self.url.as_str(), None, false, connector);

        let (websocket, _response) = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, dial).await??,
            None => dial.await?,
        };
        Ok(websocket)
    }
}

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client-role bridge: accepted local TCP connection, dialing a WebSocket URL.
pub struct ClientBridge {
    bridge: Bridge,
    target: DialTarget,
}

impl ClientBridge {
    fn new(target: DialTarget, filters: FilterSnapshot, events: EventSink) -> Self {
        Self {
            bridge: Bridge::new(BridgeRole::Client, filters, events),
            target,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.bridge.id()
    }

    #[must_use]
    pub fn state(&self) -> BridgeState {
        self.bridge.state()
    }

    /// Dials the WebSocket endpoint, then pumps until either side closes.
    ///
    /// A failed dial closes `stream` without forwarding anything and returns
    /// [`TunnelError::EndpointNotAvailable`].
    #[tracing::instrument(skip_all, fields(bridge = self.bridge.id(), url = %self.target.url, %peer))]
    pub async fn run(mut self, mut stream: TcpStream, peer: SocketAddr) -> Result<BridgeReport> {
        info!("Connecting WebSocket");

        let websocket = match self.target.connect().await {
            Ok(websocket) => websocket,
            Err(source) => {
                let err = TunnelError::EndpointNotAvailable {
                    url: self.target.url.to_string(),
                    source,
                };
                warn!(error = %err, "Closing local connection");
                if let Err(e) = stream.shutdown().await {
                    debug!(error = %e, "Could not shut down local connection");
                }
                drop(stream);
                self.bridge.dial_failed(&err, CloseCode::Error.into());
                return Err(err);
            }
        };

        info!("WebSocket connected");
        Ok(self.bridge.pump(stream, websocket).await)
    }
}

/// Client-side proxy mapping: a local port forwarded to a WebSocket URL.
pub struct ClientProxy {
    listen: Address,
    options: WsOptions,
    target: DialTarget,
    filters: Arc<FilterChain>,
    listening: Mutex<Option<Listening>>,
}

impl ClientProxy {
    /// Maps `port` on the default bind host to `ws_url`.
    pub fn new(port: u16, ws_url: &str) -> Result<Self> {
        let url = parse_ws_url(ws_url)?;
        let options = WsOptions::default();
        Ok(Self {
            listen: Address::new(DEFAULT_BIND_HOST, port),
            target: DialTarget {
                url,
                connect_timeout: options.connect_timeout(),
                tls: None,
            },
            options,
            filters: Arc::new(FilterChain::new()),
            listening: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.listen.host = Some(host.into());
        self
    }

    pub fn with_ws_options(mut self, options: WsOptions) -> Result<Self> {
        self.target.connect_timeout = options.connect_timeout();
        self.target.tls = if options.validate_cert {
            None
        } else {
            let config = insecure_client_config()
                .map_err(|e| TunnelError::config(format!("TLS client setup failed: {e}")))?;
            Some(Arc::new(config))
        };
        self.options = options;
        Ok(self)
    }

    #[must_use]
    pub fn with_filters(mut self, filters: Vec<Arc<dyn Filter>>) -> Self {
        self.filters = Arc::new(FilterChain::from(filters));
        self
    }

    #[must_use]
    pub fn ws_url(&self) -> &Url {
        &self.target.url
    }

    #[must_use]
    pub fn ws_options(&self) -> &WsOptions {
        &self.options
    }

    #[must_use]
    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    /// True while the proxy owns a live listener.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.lock_listening().is_some()
    }

    /// Address actually bound, useful with port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_listening().as_ref().map(Listening::local_addr)
    }

    fn lock_listening(&self) -> MutexGuard<'_, Option<Listening>> {
        self.listening.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the listen port and starts spawning bridges. No-op when bound.
    pub async fn start(&self, events: EventSink) -> Result<()> {
        if self.is_bound() {
            return Ok(());
        }

        let target = self.target.clone();
        let filters = Arc::clone(&self.filters);
        let listening = Listening::bind(&self.listen.to_socket_string()?, move |stream, peer| {
            let bridge = ClientBridge::new(target.clone(), filters.snapshot(), events.clone());
            async move {
                info!(%peer, bridge = bridge.id(), "Got local connection");
                // Failures are logged and reported by the bridge itself.
                let _ = bridge.run(stream, peer).await;
            }
        })
        .await?;

        let duplicate = {
            let mut guard = self.lock_listening();
            if guard.is_some() {
                Some(listening)
            } else {
                *guard = Some(listening);
                None
            }
        };
        if let Some(extra) = duplicate {
            extra.close().await;
        }
        Ok(())
    }

    /// Closes the listener. Bridges already running are left alone.
    pub async fn stop(&self) {
        let listening = self.lock_listening().take();
        if let Some(listening) = listening {
            listening.close().await;
        }
    }
}

impl fmt::Display for ClientProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listen = self
            .local_addr()
            .map_or_else(|| self.listen.clone(), Address::from);
        write!(f, "ClientProxy {listen} --> {}", self.target.url)
    }
}

/// Client endpoint: the table of [`ClientProxy`] mappings keyed by port.
#[derive(Default)]
pub struct ClientRegistry {
    proxies: Mutex<HashMap<u16, Arc<ClientProxy>>>,
    serving: AtomicBool,
    events: EventSink,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bridges spawned from now on report to `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    fn lock_proxies(&self) -> MutexGuard<'_, HashMap<u16, Arc<ClientProxy>>> {
        self.proxies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn all_proxies(&self) -> Vec<Arc<ClientProxy>> {
        self.lock_proxies().values().cloned().collect()
    }

    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Stores `proxy` under `key`, binding it right away when serving.
    ///
    /// A proxy previously stored under the same key is unbound first, so the
    /// replacement may reuse its port.
    pub async fn add_proxy(&self, key: u16, proxy: ClientProxy) -> Result<Arc<ClientProxy>> {
        let proxy = Arc::new(proxy);
        let previous = self.lock_proxies().remove(&key);
        if let Some(previous) = previous {
            info!(proxy = %previous, "Replacing proxy");
            previous.stop().await;
        }

        if self.is_serving() {
            proxy.start(self.events.clone()).await?;
            info!(%proxy, "Started proxy");
        }

        self.lock_proxies().insert(key, Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Removes the proxy under `key`, unbinding its port.
    pub async fn remove_proxy(&self, key: u16) -> Option<Arc<ClientProxy>> {
        let removed = self.lock_proxies().remove(&key);
        if let Some(proxy) = &removed {
            info!(%proxy, "Removing proxy");
            proxy.stop().await;
        }
        removed
    }

    #[must_use]
    pub fn get_proxy(&self, key: u16) -> Option<Arc<ClientProxy>> {
        self.lock_proxies().get(&key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_proxies().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_proxies().is_empty()
    }

    /// Addresses of every bound listener.
    #[must_use]
    pub fn address_list(&self) -> Vec<SocketAddr> {
        self.all_proxies()
            .iter()
            .filter_map(|proxy| proxy.local_addr())
            .collect()
    }

    /// Appends `filter` to the chain of every current proxy.
    pub fn install_filter(&self, filter: &Arc<dyn Filter>) {
        for proxy in self.all_proxies() {
            proxy.filters().install(Arc::clone(filter));
        }
    }

    /// Removes `filter` from the chain of every current proxy.
    pub fn uninstall_filter(&self, filter: &Arc<dyn Filter>) {
        for proxy in self.all_proxies() {
            proxy.filters().uninstall(filter);
        }
    }

    /// Binds every proxy. Stops at the first port that cannot be bound.
    pub async fn start(&self) -> Result<()> {
        let proxies = self.all_proxies();
        info!(proxies = proxies.len(), "Starting client endpoint");
        self.serving.store(true, Ordering::SeqCst);
        for proxy in proxies {
            if let Err(e) = proxy.start(self.events.clone()).await {
                self.stop().await;
                return Err(e);
            }
            info!(%proxy, "Started proxy");
        }
        Ok(())
    }

    /// Unbinds every proxy. Running bridges finish on their own.
    pub async fn stop(&self) {
        info!("Stopping client endpoint");
        self.serving.store(false, Ordering::SeqCst);
        for proxy in self.all_proxies() {
            proxy.stop().await;
            info!(%proxy, "Stopped proxy");
        }
    }
}
