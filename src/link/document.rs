//! Canonical engine document builder

use super::{
    Protocol, ProxyEndpoint, RealityParams, Security, Transport, DEFAULT_FINGERPRINT,
    DEFAULT_REMOTE_PORT, LOCAL_INBOUND_PORT,
};
use crate::error::ParseError;
use serde_json::{json, Map, Value};

const DNS_SERVERS: [&str; 3] = [
    "https://1.1.1.1/dns-query",
    "https://8.8.8.8/dns-query",
    "localhost",
];

/// Outbound protocols that never reach a remote proxy
const LOCAL_PROTOCOLS: [&str; 3] = ["freedom", "blackhole", "dns"];

/// Build the canonical document for an endpoint. Pure: equal endpoints give
/// equal documents.
pub fn build_document(endpoint: &ProxyEndpoint) -> Value {
    json!({
        "log": { "loglevel": "warning" },
        "dns": {
            "servers": DNS_SERVERS,
            "queryStrategy": "UseIPv4",
        },
        "inbounds": [{
            "tag": "socks-in",
            "listen": "127.0.0.1",
            "port": LOCAL_INBOUND_PORT,
            "protocol": "socks",
            "settings": { "auth": "noauth", "udp": true },
            "sniffing": { "enabled": true, "destOverride": ["http", "tls"] },
        }],
        "outbounds": [
            proxy_outbound(endpoint),
            {
                "tag": "direct",
                "protocol": "freedom",
                "settings": { "domainStrategy": "UseIP" },
            },
        ],
        "routing": {
            "domainStrategy": "IPIfNonMatch",
            "rules": [
                { "type": "field", "network": "udp", "port": 53, "outboundTag": "proxy" },
                { "type": "field", "network": "tcp,udp", "outboundTag": "proxy" },
            ],
        },
    })
}

fn proxy_outbound(endpoint: &ProxyEndpoint) -> Value {
    let mut user = Map::new();
    user.insert("id".into(), json!(endpoint.credential));
    user.insert(
        "encryption".into(),
        json!(endpoint.protocol.user_encryption()),
    );
    if let Some(flow) = endpoint.flow.as_deref().filter(|f| !f.is_empty()) {
        user.insert("flow".into(), json!(flow));
    }

    json!({
        "tag": "proxy",
        "protocol": endpoint.protocol.as_str(),
        "settings": {
            "vnext": [{
                "address": endpoint.host,
                "port": endpoint.port,
                "users": [Value::Object(user)],
            }],
        },
        "streamSettings": stream_settings(endpoint),
    })
}

fn stream_settings(endpoint: &ProxyEndpoint) -> Value {
    let mut stream = Map::new();
    stream.insert("network".into(), json!(endpoint.transport.as_str()));
    stream.insert("security".into(), json!(endpoint.security.as_str()));

    let server_name = endpoint.effective_server_name();
    match endpoint.security {
        Security::Tls => {
            stream.insert("tlsSettings".into(), json!({ "serverName": server_name }));
        }
        Security::Reality => {
            let reality = endpoint.reality.clone().unwrap_or_else(|| RealityParams {
                public_key: String::new(),
                short_id: String::new(),
                fingerprint: DEFAULT_FINGERPRINT.to_string(),
            });
            stream.insert(
                "realitySettings".into(),
                json!({
                    "serverName": server_name,
                    "publicKey": reality.public_key,
                    "shortId": reality.short_id,
                    "fingerprint": reality.fingerprint,
                }),
            );
        }
        Security::None => {}
    }

    match endpoint.transport {
        Transport::WebSocket => {
            stream.insert("wsSettings".into(), json!({ "path": endpoint.path }));
        }
        Transport::Tcp if endpoint.header_type.eq_ignore_ascii_case("http") => {
            stream.insert(
                "tcpSettings".into(),
                json!({ "header": { "type": "http" } }),
            );
        }
        Transport::Tcp => {}
    }

    Value::Object(stream)
}

/// Minimal shape check for caller-supplied documents: there must be at least
/// one outbound that actually targets a remote server.
pub(crate) fn validate_passthrough(document: &Value) -> Result<(), ParseError> {
    let root = document
        .as_object()
        .ok_or_else(|| ParseError::MalformedPayload("document is not a JSON object".into()))?;

    let outbounds = root
        .get("outbounds")
        .and_then(Value::as_array)
        .filter(|o| !o.is_empty())
        .ok_or_else(|| ParseError::MalformedPayload("document has no outbounds".into()))?;

    let routable = outbounds.iter().any(|outbound| {
        let protocol = outbound.get("protocol").and_then(Value::as_str);
        let remote = protocol.is_some_and(|p| !LOCAL_PROTOCOLS.contains(&p));
        let settings = outbound.get("settings");
        let has_servers = ["vnext", "servers"].iter().any(|key| {
            settings
                .and_then(|s| s.get(*key))
                .and_then(Value::as_array)
                .is_some_and(|list| !list.is_empty())
        });
        remote && has_servers
    });

    if routable {
        Ok(())
    } else {
        Err(ParseError::MalformedPayload(
            "document has no routable proxy outbound".into(),
        ))
    }
}

/// Fluent construction of an endpoint without a link
///
/// ```rust,ignore
/// let config = EndpointBuilder::vless()
///     .server("edge.example.com", 443)
///     .credential("3b1f...")
///     .reality("PUBKEY", "ab12", "www.microsoft.com")
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct EndpointBuilder {
    protocol: Protocol,
    host: String,
    port: u16,
    credential: String,
    security: Security,
    server_name: Option<String>,
    reality: Option<RealityParams>,
}

impl EndpointBuilder {
    pub fn vless() -> Self {
        Self::new(Protocol::Vless)
    }

    pub fn vmess() -> Self {
        Self::new(Protocol::Vmess)
    }

    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            host: String::new(),
            port: DEFAULT_REMOTE_PORT,
            credential: String::new(),
            security: Security::None,
            server_name: None,
            reality: None,
        }
    }

    pub fn server(mut self, host: &str, port: u16) -> Self {
        self.host = host.to_string();
        self.port = port;
        self
    }

    pub fn credential(mut self, id: &str) -> Self {
        self.credential = id.to_string();
        self
    }

    pub fn tls(mut self, server_name: &str) -> Self {
        self.security = Security::Tls;
        self.server_name = Some(server_name.to_string());
        self
    }

    pub fn reality(mut self, public_key: &str, short_id: &str, server_name: &str) -> Self {
        self.security = Security::Reality;
        self.server_name = Some(server_name.to_string());
        self.reality = Some(RealityParams {
            public_key: public_key.to_string(),
            short_id: short_id.to_string(),
            fingerprint: DEFAULT_FINGERPRINT.to_string(),
        });
        self
    }

    pub fn build_endpoint(self) -> Result<ProxyEndpoint, ParseError> {
        if self.host.is_empty() {
            return Err(ParseError::MissingHost);
        }
        if self.credential.is_empty() {
            return Err(ParseError::MissingCredential);
        }
        if self.port == 0 {
            return Err(ParseError::MalformedPayload("port must be 1-65535".into()));
        }

        let flow = match self.protocol {
            Protocol::Vless => Some("xtls-rprx-vision".to_string()),
            Protocol::Vmess => None,
        };

        Ok(ProxyEndpoint {
            protocol: self.protocol,
            host: self.host,
            port: self.port,
            credential: self.credential,
            security: self.security,
            transport: Transport::Tcp,
            path: String::new(),
            header_type: String::new(),
            server_name: self.server_name,
            reality: self.reality,
            flow,
            remark: None,
        })
    }

    pub fn build(self) -> Result<super::TunnelConfig, ParseError> {
        self.build_endpoint().map(|ep| ep.to_config())
    }
}
