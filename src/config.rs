use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::BTreeMap, fs, path::Path};

use crate::client::WsOptions;

/// Which side of the tunnel this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Client,
    Server,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub endpoint: EndpointKind,
    pub log_level: Option<String>,
    pub client: Option<ClientConfig>,
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Base URL each proxy resource is resolved against.
    pub ws_url: String,
    pub bind: Option<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub ws_options: WsOptions,
    /// Local port -> resource on the server endpoint.
    #[serde(default)]
    pub proxies: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    pub ssl_options: Option<TlsConfig>,
    pub allowed_proxy_ips: Option<Vec<String>>,
    pub connect_timeout_secs: Option<u64>,
    /// Request path -> mapped service.
    #[serde(default)]
    pub proxies: BTreeMap<String, ServerProxyConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServerProxyConfig {
    pub address: String,
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_config() {
        let config = parse_config(
            r#"
            endpoint = "client"
            log_level = "debug"

            [client]
            ws_url = "wss://tunnel.example.com/"
            filters = ["dump"]

            [client.ws_options]
            validate_cert = false
            connect_timeout_secs = 10

            [client.proxies]
            "2222" = "ssh"
            "8080" = "http"
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint, EndpointKind::Client);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        let client = config.client.unwrap();
        assert_eq!(client.ws_url, "wss://tunnel.example.com/");
        assert_eq!(client.bind, None);
        assert_eq!(client.filters, vec!["dump"]);
        assert!(!client.ws_options.validate_cert);
        assert_eq!(client.ws_options.connect_timeout_secs, Some(10));
        assert_eq!(client.proxies["2222"], "ssh");
        assert_eq!(client.proxies.len(), 2);
        assert!(config.server.is_none());
    }

    #[test]
    fn ws_options_default_when_omitted() {
        let config = parse_config(
            r#"
            endpoint = "client"
            [client]
            ws_url = "ws://localhost:9000/"
            "#,
        )
        .unwrap();
        let client = config.client.unwrap();
        assert!(client.ws_options.validate_cert);
        assert!(client.proxies.is_empty());
    }

    #[test]
    fn parses_server_config() {
        let config = parse_config(
            r#"
            endpoint = "server"

            [server]
            listen = "0.0.0.0:9000"
            ssl = true
            allowed_proxy_ips = ["10.0.0.0/8", "127.0.0.1"]
            connect_timeout_secs = 5

            [server.ssl_options]
            cert_file = "cert.pem"
            key_file = "key.pem"

            [server.proxies."/ssh"]
            address = "127.0.0.1:22"
            filters = ["dump"]

            [server.proxies.db]
            address = "5432"
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint, EndpointKind::Server);
        let server = config.server.unwrap();
        assert_eq!(server.listen.as_deref(), Some("0.0.0.0:9000"));
        assert!(server.ssl);
        assert_eq!(server.ssl_options.unwrap().cert_file, "cert.pem");
        assert_eq!(server.allowed_proxy_ips.unwrap().len(), 2);
        assert_eq!(server.connect_timeout_secs, Some(5));
        assert_eq!(server.proxies["/ssh"].address, "127.0.0.1:22");
        assert_eq!(server.proxies["/ssh"].filters, vec!["dump"]);
        assert!(server.proxies["db"].filters.is_empty());
    }

    #[test]
    fn rejects_unknown_endpoint_kind() {
        assert!(parse_config("endpoint = \"relay\"").is_err());
        assert!(parse_config("log_level = \"info\"").is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load_config(Path::new("/nonexistent/wstunnel.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/wstunnel.toml"));
    }
}
