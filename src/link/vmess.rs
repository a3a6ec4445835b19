//! `vmess://<base64 JSON>` parsing

use super::{Protocol, ProxyEndpoint, Security, Transport, DEFAULT_REMOTE_PORT};
use crate::error::ParseError;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

pub(super) fn parse(payload: &str) -> Result<ProxyEndpoint, ParseError> {
    let text = decode_base64(payload)?;
    let text = repair_bare_keys(&text);

    let value: Value = serde_json::from_str(&text)?;
    let obj = value
        .as_object()
        .ok_or_else(|| ParseError::MalformedPayload("vmess payload is not a JSON object".into()))?;

    let host = mandatory(obj, "add")?;
    if host.is_empty() {
        return Err(ParseError::MissingHost);
    }
    let credential = mandatory(obj, "id")?;
    if credential.is_empty() {
        return Err(ParseError::MissingCredential);
    }

    let tls = optional(obj, "tls");
    let security = if !tls.is_empty() && !tls.eq_ignore_ascii_case("none") {
        Security::Tls
    } else {
        Security::None
    };

    let port = port(obj);
    let sni = optional(obj, "sni");
    let remark = optional(obj, "ps");

    log::debug!("Parsed vmess link for {host}:{port} ({})", security.as_str());

    Ok(ProxyEndpoint {
        protocol: Protocol::Vmess,
        host,
        port,
        credential,
        security,
        transport: Transport::from_param(&optional(obj, "net")),
        path: optional(obj, "path"),
        header_type: optional(obj, "type"),
        server_name: Some(sni).filter(|s| !s.is_empty()),
        reality: None,
        flow: None,
        remark: Some(remark).filter(|r| !r.is_empty()),
    })
}

/// Decode padded or unpadded Base64 in either alphabet
fn decode_base64(payload: &str) -> Result<String, ParseError> {
    let mut padded: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    let bytes = STANDARD
        .decode(&padded)
        .or_else(|_| URL_SAFE.decode(&padded))
        .map_err(|e| ParseError::MalformedPayload(format!("invalid vmess Base64: {e}")))?;

    String::from_utf8(bytes)
        .map_err(|_| ParseError::MalformedPayload("vmess payload is not UTF-8".into()))
}

/// Some providers emit `"tls",` with no value; give the key its own name as
/// value so the object parses. Only a key position (after `{` or `,`) is
/// touched, never a `"tls"` value.
fn repair_bare_keys(text: &str) -> String {
    static BARE_TLS: OnceLock<Option<Regex>> = OnceLock::new();
    match BARE_TLS.get_or_init(|| Regex::new(r#"([{,]\s*)"tls"\s*,"#).ok()) {
        Some(re) => re.replace_all(text, r#"${1}"tls":"tls","#).into_owned(),
        None => text.to_string(),
    }
}

fn mandatory(obj: &Map<String, Value>, key: &str) -> Result<String, ParseError> {
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(ParseError::MalformedPayload(format!(
            "vmess field '{key}' has the wrong type"
        ))),
        None => Err(ParseError::MalformedPayload(format!(
            "vmess field '{key}' is missing"
        ))),
    }
}

/// Optional string fields default to empty when missing or not a string
fn optional(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// `port` may be a number or a numeric string; anything else means 443
fn port(obj: &Map<String, Value>) -> u16 {
    let parsed = match obj.get("port") {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    match parsed {
        Some(p) if p != 0 => p,
        Some(_) | None => {
            if obj.contains_key("port") {
                log::warn!("Ignoring malformed vmess port, using {DEFAULT_REMOTE_PORT}");
            }
            DEFAULT_REMOTE_PORT
        }
    }
}
