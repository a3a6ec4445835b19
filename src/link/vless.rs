//! `vless://<id>@<host>:<port>?<params>#<remark>` parsing

use super::{
    Protocol, ProxyEndpoint, RealityParams, Security, Transport, DEFAULT_FINGERPRINT,
    DEFAULT_REMOTE_PORT,
};
use crate::error::ParseError;
use std::collections::HashMap;
use url::Url;

pub(super) fn parse(link: &str) -> Result<ProxyEndpoint, ParseError> {
    let url = Url::parse(link)
        .map_err(|e| ParseError::MalformedPayload(format!("invalid vless URI: {e}")))?;

    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .filter(|h| !h.is_empty())
        .ok_or(ParseError::MissingHost)?
        .to_string();

    let credential = decode_component(url.username());
    if credential.is_empty() {
        return Err(ParseError::MissingCredential);
    }

    let port = match url.port() {
        Some(0) => {
            return Err(ParseError::MalformedPayload(
                "port must be 1-65535".to_string(),
            ))
        }
        Some(port) => port,
        None => DEFAULT_REMOTE_PORT,
    };

    // Last occurrence wins, matching common link generators
    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    let param = |key: &str| params.get(key).map(String::as_str).unwrap_or_default();
    let non_empty = |key: &str| Some(param(key)).filter(|v| !v.is_empty()).map(str::to_string);

    let security = Security::from_param(param("security"));
    let reality = (security == Security::Reality).then(|| RealityParams {
        public_key: param("pbk").to_string(),
        short_id: param("sid").to_string(),
        fingerprint: non_empty("fp").unwrap_or_else(|| DEFAULT_FINGERPRINT.to_string()),
    });

    let remark = url
        .fragment()
        .map(decode_component)
        .filter(|r| !r.is_empty());

    log::debug!("Parsed vless link for {host}:{port} ({})", security.as_str());

    Ok(ProxyEndpoint {
        protocol: Protocol::Vless,
        host,
        port,
        credential,
        security,
        transport: Transport::from_param(param("type")),
        path: param("path").to_string(),
        header_type: param("headerType").to_string(),
        server_name: non_empty("sni"),
        reality,
        flow: non_empty("flow"),
        remark,
    })
}

/// Percent-decode a URI component, keeping the raw text if it is not UTF-8
fn decode_component(raw: &str) -> String {
    url::form_urlencoded::parse(format!("v={}", raw.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| raw.to_string())
}
