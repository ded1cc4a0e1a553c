//! Server endpoint: accepts WebSockets and forwards them to mapped TCP services.
//!
//! The request path of the WebSocket handshake selects the [`ServerProxy`];
//! an unmapped path is answered with `404 Not Found` before any bridge exists.

use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::{
        Utf8Bytes,
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::bridge::{Bridge, BridgeReport, BridgeRole, BridgeState, EventSink};
use crate::error::{Result, TunnelError};
use crate::filter::{Filter, FilterChain};
use crate::listener::Listening;
use crate::security::{PeerAllowlist, forwarded_client_ip};
use crate::stream::IncomingStream;

/// Host the server endpoint listens on when none is configured.
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
/// Host of a mapped service when its address only names a port.
pub const DEFAULT_TARGET_HOST: &str = "127.0.0.1";

/// Server-side proxy mapping: one request path forwarded to a TCP service.
pub struct ServerProxy {
    address: Address,
    target: String,
    filters: Arc<FilterChain>,
}

impl ServerProxy {
    /// `address` is `"host:port"` or just `"port"`.
    pub fn new(address: &str) -> Result<Self> {
        let address: Address = address.parse()?;
        if address.port.is_none() {
            return Err(TunnelError::InvalidAddress(format!(
                "mapped service '{address}' needs a port"
            )));
        }
        let address = address.or_host(DEFAULT_TARGET_HOST);
        Ok(Self {
            target: address.to_socket_string()?,
            address,
            filters: Arc::new(FilterChain::new()),
        })
    }

    #[must_use]
    pub fn with_filters(mut self, filters: Vec<Arc<dyn Filter>>) -> Self {
        self.filters = Arc::new(FilterChain::from(filters));
        self
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[must_use]
    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }
}

impl fmt::Display for ServerProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerProxy --> {}", self.address)
    }
}

/// Server-role bridge: accepted WebSocket, dialing the mapped TCP service.
pub struct ServerBridge {
    bridge: Bridge,
    target: String,
    connect_timeout: Option<Duration>,
}

impl ServerBridge {
    fn new(proxy: &ServerProxy, connect_timeout: Option<Duration>, events: EventSink) -> Self {
        Self {
            bridge: Bridge::new(BridgeRole::Server, proxy.filters.snapshot(), events),
            target: proxy.target.clone(),
            connect_timeout,
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

    async fn connect(&self) -> io::Result<TcpStream> {
        let dial = TcpStream::connect(&self.target);
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::TimedOut, e))?,
            None => dial.await,
        }
    }

    /// Dials the mapped service, then pumps until either side closes.
    ///
    /// A failed dial closes `websocket` with code 1013 without forwarding
    /// anything and returns [`TunnelError::MappedServiceNotAvailable`].
    #[tracing::instrument(skip_all, fields(bridge = self.bridge.id(), target_addr = %self.target))]
    pub async fn run<S>(mut self, mut websocket: WebSocketStream<S>) -> Result<BridgeReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("Attempting to connect to target server");

        let stream = match self.connect().await {
            Ok(stream) => stream,
            Err(source) => {
                let err = TunnelError::MappedServiceNotAvailable {
                    address: self.target.clone(),
                    source,
                };
                warn!(error = %err, "Closing WebSocket");
                let frame = CloseFrame {
                    code: CloseCode::Again,
                    reason: Utf8Bytes::from_static("mapped service not available"),
                };
                if let Err(e) = websocket.close(Some(frame)).await {
                    debug!(error = %e, "Could not close WebSocket");
                }
                drop(websocket);
                self.bridge.dial_failed(&err, CloseCode::Again.into());
                return Err(err);
            }
        };

        info!("Connected to target server");
        Ok(self.bridge.pump(stream, websocket).await)
    }
}

type Routes = HashMap<String, Arc<ServerProxy>>;
type RouteTable = Arc<RwLock<Routes>>;

fn read_routes(routes: &RouteTable) -> RwLockReadGuard<'_, Routes> {
    routes.read().unwrap_or_else(PoisonError::into_inner)
}

fn normalise_path(key: &str) -> String {
    if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/{key}")
    }
}

/// What every accepted connection of a running server endpoint shares.
struct Acceptor {
    routes: RouteTable,
    tls: Option<TlsAcceptor>,
    allowlist: Option<PeerAllowlist>,
    connect_timeout: Option<Duration>,
    events: EventSink,
}

impl Acceptor {
    #[tracing::instrument(skip_all, fields(client_addr = %peer))]
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if self
            .allowlist
            .as_ref()
            .is_some_and(|allowlist| !allowlist.allows(peer.ip()))
        {
            warn!("Rejecting connection from peer outside the allowlist");
            return Ok(());
        }

        let stream = IncomingStream::accept(stream, self.tls.as_ref()).await?;
        debug!(tls = stream.is_tls(), "Accepted connection");

        let route = Arc::new(Mutex::new(None::<(String, Arc<ServerProxy>)>));
        let client_ip = Arc::new(Mutex::new(None::<String>));
        let callback = {
            let routes = Arc::clone(&self.routes);
            let route = Arc::clone(&route);
            let client_ip = Arc::clone(&client_ip);
            move |req: &Request, response: Response| {
                if let Some(original_ip) = req
                    .headers()
                    .get("x-forwarded-for")
                    .and_then(|xff| xff.to_str().ok())
                    .and_then(forwarded_client_ip)
                {
                    *client_ip.lock().unwrap_or_else(PoisonError::into_inner) = Some(original_ip);
                }

                let path = req.uri().path();
                let Some(proxy) = read_routes(&routes).get(path).cloned() else {
                    info!(path, "No proxy mapped on path");
                    let mut not_found = ErrorResponse::new(Some(format!("no proxy mapped on {path}")));
                    *not_found.status_mut() = StatusCode::NOT_FOUND;
                    return Err(not_found);
                };
                *route.lock().unwrap_or_else(PoisonError::into_inner) = Some((path.to_string(), proxy));
                Ok(response)
            }
        };

        let websocket = accept_hdr_async(stream, callback).await?;

        let route = route.lock().unwrap_or_else(PoisonError::into_inner).take();
        let original_client_ip = client_ip.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some((path, proxy)) = route else {
            return Err(TunnelError::config("handshake completed without a route"));
        };

        match original_client_ip {
            Some(ref ip) => {
                info!(
                    %path,
                    target_addr = %proxy.target,
                    client_ip = %ip,
                    direct_addr = %peer,
                    "Routing request"
                );
            }
            None => {
                info!(%path, target_addr = %proxy.target, client_ip = %peer, "Routing request");
            }
        }

        ServerBridge::new(&proxy, self.connect_timeout, self.events.clone())
            .run(websocket)
            .await?;
        Ok(())
    }
}

/// Server endpoint: one listener and the table of [`ServerProxy`] mappings
/// keyed by request path.
pub struct ServerRegistry {
    listen: Address,
    tls: Option<TlsAcceptor>,
    allowlist: Option<PeerAllowlist>,
    connect_timeout: Option<Duration>,
    routes: RouteTable,
    listening: Mutex<Option<Listening>>,
    serving: AtomicBool,
    events: EventSink,
}

impl ServerRegistry {
    /// `listen` is `"host:port"`, `"host"` or `"port"`; missing halves
    /// default to all interfaces and an ephemeral port.
    pub fn new(listen: &str) -> Result<Self> {
        let listen: Address = listen.parse()?;
        Ok(Self {
            listen: listen.or_host(DEFAULT_LISTEN_HOST).or_port(0),
            tls: None,
            allowlist: None,
            connect_timeout: None,
            routes: Arc::default(),
            listening: Mutex::new(None),
            serving: AtomicBool::new(false),
            events: EventSink::none(),
        })
    }

    /// Terminates TLS on the listener.
    #[must_use]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Only peers in `allowlist` may open connections.
    #[must_use]
    pub fn with_allowlist(mut self, allowlist: PeerAllowlist) -> Self {
        self.allowlist = Some(allowlist);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    fn lock_listening(&self) -> MutexGuard<'_, Option<Listening>> {
        self.listening.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn all_proxies(&self) -> Vec<Arc<ServerProxy>> {
        read_routes(&self.routes).values().cloned().collect()
    }

    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Maps `key` to `proxy`. A missing leading `/` is added.
    ///
    /// Takes effect for the next handshake, also while serving.
    pub fn add_proxy(&self, key: &str, proxy: ServerProxy) -> Arc<ServerProxy> {
        let path = normalise_path(key);
        let proxy = Arc::new(proxy);
        info!(%path, %proxy, "Adding proxy");
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, Arc::clone(&proxy));
        proxy
    }

    /// Unmaps `key`. Bridges already running on it are left alone.
    pub fn remove_proxy(&self, key: &str) -> Option<Arc<ServerProxy>> {
        let path = normalise_path(key);
        let removed = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&path);
        if let Some(proxy) = &removed {
            info!(%path, %proxy, "Removed proxy");
        }
        removed
    }

    #[must_use]
    pub fn get_proxy(&self, key: &str) -> Option<Arc<ServerProxy>> {
        read_routes(&self.routes).get(&normalise_path(key)).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        read_routes(&self.routes).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        read_routes(&self.routes).is_empty()
    }

    /// Mapped request paths, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = read_routes(&self.routes).keys().cloned().collect();
        paths.sort();
        paths
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

    /// Address actually bound, useful with port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_listening().as_ref().map(Listening::local_addr)
    }

    #[must_use]
    pub fn address_list(&self) -> Vec<SocketAddr> {
        self.local_addr().into_iter().collect()
    }

    /// Binds the listener. No-op when already serving.
    pub async fn start(&self) -> Result<()> {
        if self.lock_listening().is_some() {
            return Ok(());
        }

        let acceptor = Arc::new(Acceptor {
            routes: Arc::clone(&self.routes),
            tls: self.tls.clone(),
            allowlist: self.allowlist.clone(),
            connect_timeout: self.connect_timeout,
            events: self.events.clone(),
        });
        info!(
            listen_addr = %self.listen,
            tls = acceptor.tls.is_some(),
            proxies = self.len(),
            "Starting server endpoint"
        );

        let listening = Listening::bind(&self.listen.to_socket_string()?, move |stream, peer| {
            let acceptor = Arc::clone(&acceptor);
            async move {
                if let Err(e) = acceptor.serve(stream, peer).await {
                    debug!(client_addr = %peer, error = %e, "Connection ended with error");
                }
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
        self.serving.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Closes the listener. Bridges already running are left alone.
    pub async fn stop(&self) {
        info!("Stopping server endpoint");
        self.serving.store(false, Ordering::SeqCst);
        let listening = self.lock_listening().take();
        if let Some(listening) = listening {
            listening.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeEvent;
    use crate::error::FailureKind;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn mapped_service_needs_a_port() {
        let proxy = ServerProxy::new("22").unwrap();
        assert_eq!(proxy.address(), &Address::new("127.0.0.1", 22));
        assert_eq!(proxy.to_string(), "ServerProxy --> 127.0.0.1:22");

        let proxy = ServerProxy::new("10.0.0.5:5432").unwrap();
        assert_eq!(proxy.target, "10.0.0.5:5432");

        let err = ServerProxy::new("localhost").err().unwrap();
        assert!(matches!(err, TunnelError::InvalidAddress(_)));
    }

    #[test]
    fn listen_address_gets_defaults() {
        let registry = ServerRegistry::new("9000").unwrap();
        assert_eq!(registry.listen, Address::new("0.0.0.0", 9000));

        let registry = ServerRegistry::new("127.0.0.1").unwrap();
        assert_eq!(registry.listen, Address::new("127.0.0.1", 0));
    }

    #[test]
    fn paths_are_normalised() {
        let registry = ServerRegistry::new("127.0.0.1:0").unwrap();
        let added = registry.add_proxy("ssh", ServerProxy::new("22").unwrap());

        assert!(Arc::ptr_eq(&added, &registry.get_proxy("/ssh").unwrap()));
        assert!(registry.get_proxy("ssh").is_some());
        assert_eq!(registry.paths(), vec!["/ssh".to_string()]);

        assert!(registry.remove_proxy("/ssh").is_some());
        assert!(registry.is_empty());
        assert!(registry.remove_proxy("ssh").is_none());
    }

    #[test]
    fn filters_are_broadcast_to_every_proxy() {
        let registry = ServerRegistry::new("127.0.0.1:0").unwrap();
        let a = registry.add_proxy("/a", ServerProxy::new("1000").unwrap());
        let b = registry.add_proxy("/b", ServerProxy::new("1001").unwrap());

        let filter: Arc<dyn Filter> = Arc::new(crate::dump::DumpFilter::new());
        registry.install_filter(&filter);
        assert_eq!(a.filters().len(), 1);
        assert_eq!(b.filters().len(), 1);

        registry.uninstall_filter(&filter);
        assert!(a.filters().is_empty() && b.filters().is_empty());
    }

    #[tokio::test]
    async fn start_and_stop_release_the_port() {
        let registry = ServerRegistry::new("127.0.0.1:0").unwrap();
        assert!(registry.address_list().is_empty());

        registry.start().await.unwrap();
        assert!(registry.is_serving());
        let addr = registry.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        registry.stop().await;
        assert!(!registry.is_serving());
        assert!(registry.local_addr().is_none());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn unknown_path_is_rejected_with_404() {
        let registry = ServerRegistry::new("127.0.0.1:0").unwrap();
        registry.add_proxy("/known", ServerProxy::new("22").unwrap());
        registry.start().await.unwrap();
        let addr = registry.local_addr().unwrap();

        match connect_async(format!("ws://{addr}/unknown")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("handshake on an unmapped path must fail"),
        }
        registry.stop().await;
    }

    #[tokio::test]
    async fn peers_outside_the_allowlist_are_dropped() {
        let allowlist = PeerAllowlist::parse(&["10.0.0.0/8"]).unwrap();
        let registry = ServerRegistry::new("127.0.0.1:0")
            .unwrap()
            .with_allowlist(allowlist);
        registry.add_proxy("/test", ServerProxy::new("22").unwrap());
        registry.start().await.unwrap();
        let addr = registry.local_addr().unwrap();

        let result = tokio::time::timeout(TEST_TIMEOUT, connect_async(format!("ws://{addr}/test")))
            .await
            .unwrap();
        assert!(result.is_err());
        registry.stop().await;
    }

    #[tokio::test]
    async fn unreachable_service_closes_websocket_with_1013() {
        let (events, mut rx) = EventSink::channel();
        let registry = ServerRegistry::new("127.0.0.1:0")
            .unwrap()
            .with_events(events);
        let port = closed_port().await;
        registry.add_proxy("/down", ServerProxy::new(&port.to_string()).unwrap());
        registry.start().await.unwrap();
        let addr = registry.local_addr().unwrap();

        let (mut ws, _) = connect_async(format!("ws://{addr}/down")).await.unwrap();
        let msg = tokio::time::timeout(TEST_TIMEOUT, ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Again),
            other => panic!("expected close frame, got {other:?}"),
        }

        match tokio::time::timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap() {
            BridgeEvent::Closed(report) => {
                assert_eq!(report.failure, Some(FailureKind::MappedServiceNotAvailable));
                assert_eq!(report.close_code, 1013);
            }
            other => panic!("expected close event, got {other:?}"),
        }
        registry.stop().await;
    }
}
