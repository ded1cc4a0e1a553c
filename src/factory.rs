//! Turning configuration into running endpoints.
//!
//! Filters are looked up by name in a [`FilterFactory`]; everything that can
//! be wrong with a configuration is reported here, before any socket exists.

use std::{collections::HashMap, fmt, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tracing::info;

use crate::address::join_url;
use crate::bridge::EventSink;
use crate::client::{ClientProxy, ClientRegistry};
use crate::config::{ClientConfig, Config, EndpointKind, ServerConfig};
use crate::dump::DumpFilter;
use crate::error::{Result, TunnelError};
use crate::filter::Filter;
use crate::security::PeerAllowlist;
use crate::server::{ServerProxy, ServerRegistry};
use crate::tls::load_tls_acceptor;

type Constructor = Box<dyn Fn() -> Arc<dyn Filter> + Send + Sync>;

/// Named filter constructors.
pub struct FilterFactory {
    constructors: HashMap<String, Constructor>,
}

impl FilterFactory {
    /// An empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// A factory knowing the built-in filters.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register("dump", || Arc::new(DumpFilter::new()));
        factory.register("wstunnel.filters.DumpFilter", || Arc::new(DumpFilter::new()));
        factory
    }

    /// Registers `constructor` under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Arc<dyn Filter> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn Filter>> {
        self.constructors
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| TunnelError::UnknownFilter(name.to_string()))
    }

    pub fn create_all<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<dyn Filter>>> {
        names.iter().map(|name| self.create(name.as_ref())).collect()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for FilterFactory {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for FilterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterFactory")
            .field("filters", &self.names())
            .finish()
    }
}

/// A configured tunnel endpoint of either role.
pub enum Endpoint {
    Client(ClientRegistry),
    Server(ServerRegistry),
}

impl Endpoint {
    #[must_use]
    pub fn kind(&self) -> EndpointKind {
        match self {
            Self::Client(_) => EndpointKind::Client,
            Self::Server(_) => EndpointKind::Server,
        }
    }

    pub async fn start(&self) -> Result<()> {
        match self {
            Self::Client(registry) => registry.start().await,
            Self::Server(registry) => registry.start().await,
        }
    }

    pub async fn stop(&self) {
        match self {
            Self::Client(registry) => registry.stop().await,
            Self::Server(registry) => registry.stop().await,
        }
    }

    #[must_use]
    pub fn address_list(&self) -> Vec<SocketAddr> {
        match self {
            Self::Client(registry) => registry.address_list(),
            Self::Server(registry) => registry.address_list(),
        }
    }
}

/// Builds a client endpoint, one proxy per `port = "resource"` entry.
pub async fn create_client_endpoint(
    config: &ClientConfig,
    factory: &FilterFactory,
    events: EventSink,
) -> Result<ClientRegistry> {
    let filters = factory.create_all(config.filters.as_slice())?;
    let registry = ClientRegistry::new().with_events(events);

    for (port, resource) in &config.proxies {
        let port: u16 = port
            .parse()
            .map_err(|_| TunnelError::InvalidAddress(format!("invalid local port '{port}'")))?;
        let url = join_url(&config.ws_url, resource)?;

        let mut proxy = ClientProxy::new(port, url.as_str())?
            .with_ws_options(config.ws_options.clone())?
            .with_filters(filters.clone());
        if let Some(bind) = &config.bind {
            proxy = proxy.with_bind_host(bind.as_str());
        }
        info!(%proxy, "Configured proxy");
        registry.add_proxy(port, proxy).await?;
    }
    Ok(registry)
}

/// Builds a server endpoint, loading TLS material when `ssl` is set.
pub fn create_server_endpoint(
    config: &ServerConfig,
    factory: &FilterFactory,
    events: EventSink,
) -> anyhow::Result<ServerRegistry> {
    let mut registry =
        ServerRegistry::new(config.listen.as_deref().unwrap_or("0.0.0.0:0"))?.with_events(events);

    if config.ssl {
        let tls = config
            .ssl_options
            .as_ref()
            .ok_or_else(|| TunnelError::config("ssl is enabled but [server.ssl_options] is missing"))?;
        let acceptor = load_tls_acceptor(tls).context("Failed to load TLS configuration")?;
        registry = registry.with_tls(acceptor);
    }
    if let Some(ips) = &config.allowed_proxy_ips {
        registry = registry.with_allowlist(PeerAllowlist::parse(ips.as_slice())?);
    }
    if let Some(secs) = config.connect_timeout_secs {
        registry = registry.with_connect_timeout(Duration::from_secs(secs));
    }

    for (path, proxy_config) in &config.proxies {
        let proxy = ServerProxy::new(&proxy_config.address)
            .with_context(|| format!("Invalid mapping for path {path}"))?
            .with_filters(factory.create_all(proxy_config.filters.as_slice())?);
        registry.add_proxy(path, proxy);
    }
    Ok(registry)
}

/// Builds the endpoint selected by `config.endpoint`.
pub async fn create_endpoint(
    config: &Config,
    factory: &FilterFactory,
    events: EventSink,
) -> anyhow::Result<Endpoint> {
    match config.endpoint {
        EndpointKind::Client => {
            let client = config
                .client
                .as_ref()
                .ok_or_else(|| TunnelError::config("missing [client] section"))?;
            Ok(Endpoint::Client(
                create_client_endpoint(client, factory, events).await?,
            ))
        }
        EndpointKind::Server => {
            let server = config
                .server
                .as_ref()
                .ok_or_else(|| TunnelError::config("missing [server] section"))?;
            Ok(Endpoint::Server(create_server_endpoint(server, factory, events)?))
        }
    }
}
