//! Link translation
//!
//! Turns user input (a `vless://` or `vmess://` link, or a pre-built JSON
//! document) into a [`TunnelConfig`] the engine can run.
//!
//! ```rust,ignore
//! let config = tunsession::link::translate("vless://id@example.com:443?security=tls")?;
//! assert_eq!(config.endpoint().unwrap().port, 443);
//! ```

use crate::error::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

mod document;
mod vless;
mod vmess;

pub use document::{build_document, EndpointBuilder};

/// Fixed loopback port of the engine's SOCKS inbound
pub const LOCAL_INBOUND_PORT: u16 = 20808;

/// Port used when a link omits one
pub const DEFAULT_REMOTE_PORT: u16 = 443;

/// Fingerprint used by reality mode when the link omits one
pub const DEFAULT_FINGERPRINT: &str = "chrome";

const VLESS_SCHEME: &str = "vless://";
const VMESS_SCHEME: &str = "vmess://";

/// Proxy protocols understood by the translator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Vmess,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Vmess => "vmess",
        }
    }

    /// Per-user encryption tag expected by the engine
    pub fn user_encryption(&self) -> &'static str {
        match self {
            Protocol::Vless => "none",
            Protocol::Vmess => "auto",
        }
    }
}

/// Transport security of the proxy connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
            Security::Reality => "reality",
        }
    }

    pub(crate) fn from_param(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "" | "none" => Security::None,
            "tls" => Security::Tls,
            "reality" => Security::Reality,
            other => {
                log::warn!("Unknown security mode '{other}', using none");
                Security::None
            }
        }
    }
}

/// Stream transport of the proxy connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    #[serde(rename = "ws")]
    WebSocket,
}

impl Transport {
    /// Network name as written in the engine document
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::WebSocket => "ws",
        }
    }

    pub(crate) fn from_param(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "" | "tcp" | "raw" => Transport::Tcp,
            "ws" | "websocket" => Transport::WebSocket,
            other => {
                log::warn!("Unsupported transport '{other}', using tcp");
                Transport::Tcp
            }
        }
    }
}

/// Reality handshake parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealityParams {
    pub public_key: String,
    pub short_id: String,
    pub fingerprint: String,
}

/// Structured description of the remote proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Credential identifier (normally a UUID)
    pub credential: String,
    pub security: Security,
    pub transport: Transport,
    /// WebSocket path
    pub path: String,
    /// TCP header obfuscation type (`http` or empty)
    pub header_type: String,
    /// SNI override; the host is used when absent
    pub server_name: Option<String>,
    pub reality: Option<RealityParams>,
    /// Flow control tag (VLESS only)
    pub flow: Option<String>,
    /// Human readable label carried by the link
    pub remark: Option<String>,
}

impl ProxyEndpoint {
    /// SNI sent to the remote: the override when present, else the host
    pub fn effective_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }

    /// Build the canonical engine document for this endpoint
    pub fn to_config(&self) -> TunnelConfig {
        TunnelConfig {
            endpoint: Some(self.clone()),
            document: build_document(self),
        }
    }
}

/// Engine-ready tunnel configuration
///
/// Immutable once built. `endpoint` is `None` for documents supplied as raw
/// JSON by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConfig {
    endpoint: Option<ProxyEndpoint>,
    document: serde_json::Value,
}

impl TunnelConfig {
    /// Re-read a document previously produced by [`TunnelConfig::to_json`] or
    /// supplied by the user
    pub fn from_document(json: &str) -> Result<Self, ParseError> {
        let document: serde_json::Value = serde_json::from_str(json.trim())?;
        document::validate_passthrough(&document)?;
        Ok(Self {
            endpoint: None,
            document,
        })
    }

    pub fn endpoint(&self) -> Option<&ProxyEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn document(&self) -> &serde_json::Value {
        &self.document
    }

    /// Serialized document handed to the engine
    pub fn to_json(&self) -> String {
        self.document.to_string()
    }

    /// Protocol of the `proxy` outbound, if any
    pub fn outbound_protocol(&self) -> Option<&str> {
        self.document
            .get("outbounds")?
            .as_array()?
            .iter()
            .find(|o| o.get("tag").and_then(|t| t.as_str()) == Some("proxy"))
            .or_else(|| self.document.get("outbounds")?.as_array()?.first())?
            .get("protocol")?
            .as_str()
    }
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Some(ep) => write!(f, "{}://{}:{}", ep.protocol.as_str(), ep.host, ep.port),
            None => write!(f, "custom document"),
        }
    }
}

/// Translate a connection link or JSON document into a [`TunnelConfig`]
pub fn translate(input: &str) -> Result<TunnelConfig, ParseError> {
    let input = input.trim();

    let result = if input.starts_with('{') {
        TunnelConfig::from_document(input)
    } else if input.starts_with(VLESS_SCHEME) {
        vless::parse(input).map(|ep| ep.to_config())
    } else if let Some(payload) = input.strip_prefix(VMESS_SCHEME) {
        vmess::parse(payload).map(|ep| ep.to_config())
    } else {
        let scheme = input.split("://").next().unwrap_or_default();
        Err(ParseError::UnsupportedProtocol(format!(
            "'{scheme}' (only vless:// and vmess:// links or JSON documents are supported)"
        )))
    };

    if let Err(e) = &result {
        log::warn!("Failed to translate link: {e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const REALITY_LINK: &str =
        "vless://uuid-1@example.com:443?security=reality&sni=a.com&pbk=PK&sid=SID&fp=chrome";

    #[test]
    fn test_reality_scenario() {
        let config = translate(REALITY_LINK).unwrap();
        let proxy = &config.document()["outbounds"][0];
        assert_eq!(proxy["protocol"], "vless");
        assert_eq!(proxy["settings"]["vnext"][0]["address"], "example.com");
        assert_eq!(proxy["settings"]["vnext"][0]["port"], 443);
        let stream = &proxy["streamSettings"];
        assert_eq!(stream["security"], "reality");
        assert_eq!(stream["realitySettings"]["serverName"], "a.com");
        assert_eq!(stream["realitySettings"]["publicKey"], "PK");
        assert_eq!(stream["realitySettings"]["shortId"], "SID");
        assert_eq!(stream["realitySettings"]["fingerprint"], "chrome");
        assert_eq!(config.outbound_protocol(), Some("vless"));
    }

    #[test]
    fn test_translation_is_deterministic() {
        let vmess = format!(
            "vmess://{}",
            base64_encode(r#"{"add":"v.example.org","port":"8443","id":"abc","net":"ws","path":"/ws","tls":"tls"}"#)
        );
        for link in [REALITY_LINK, vmess.as_str()] {
            let a = translate(link).unwrap();
            let b = translate(link).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.to_json(), b.to_json());
        }
    }

    #[test]
    fn test_unsupported_protocols() {
        for input in [
            "trojan://pass@host:443",
            "ss://abc",
            "https://example.com",
            "",
            "   ",
            "[1,2]",
            "VLESS://uuid@host:443",
        ] {
            assert!(
                matches!(translate(input), Err(ParseError::UnsupportedProtocol(_))),
                "expected UnsupportedProtocol for {input:?}"
            );
        }
    }

    #[test]
    fn test_leading_whitespace_is_ignored() {
        let config = translate(&format!("  {REALITY_LINK}\n")).unwrap();
        assert_eq!(config.endpoint().unwrap().host, "example.com");
    }

    #[test]
    fn test_passthrough_document() {
        let doc = r#"{
            "outbounds": [
                {"tag": "proxy", "protocol": "trojan", "settings": {"servers": [{"address": "t.example", "port": 443}]}},
                {"tag": "direct", "protocol": "freedom"}
            ]
        }"#;
        let config = translate(doc).unwrap();
        assert!(config.endpoint().is_none());
        assert_eq!(config.outbound_protocol(), Some("trojan"));
        assert_eq!(config.to_string(), "custom document");
    }

    #[test]
    fn test_passthrough_rejects_unroutable_documents() {
        for doc in [
            "{",
            r#"{"inbounds": []}"#,
            r#"{"outbounds": []}"#,
            r#"{"outbounds": [{"protocol": "freedom", "settings": {}}]}"#,
            r#"{"outbounds": [{"protocol": "vless", "settings": {"vnext": []}}]}"#,
        ] {
            assert!(
                matches!(translate(doc), Err(ParseError::MalformedPayload(_))),
                "expected MalformedPayload for {doc}"
            );
        }
    }

    #[test]
    fn test_generated_document_round_trips_through_passthrough() {
        let config = translate(REALITY_LINK).unwrap();
        let reread = TunnelConfig::from_document(&config.to_json()).unwrap();
        assert_eq!(reread.document(), config.document());
    }

    fn base64_encode(s: &str) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(s)
    }
}
