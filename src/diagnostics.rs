//! Connectivity and exit-IP diagnostics

use crate::error::{ParseError, Result, TunError};
use crate::link::LOCAL_INBOUND_PORT;
use serde_json::Value;
use std::time::Duration;

pub const CONNECTIVITY_URL: &str = "http://connectivitycheck.gstatic.com/generate_204";
pub const IP_INFO_URL: &str = "https://ipwho.is/";

const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(3);
const IP_INFO_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit address details as seen by a public lookup service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpInfo {
    pub ip: String,
    pub country: String,
    pub country_code: String,
    pub region: String,
    pub city: String,
    pub isp: String,
    pub timezone: String,
}

impl IpInfo {
    /// Parse a lookup response. Understands the ipwho.is layout and the flat
    /// ip-api layout; missing fields fall back to defaults.
    pub fn from_json(json: &str) -> std::result::Result<Self, ParseError> {
        let value: Value = serde_json::from_str(json)?;
        if !value.is_object() {
            return Err(ParseError::MalformedPayload(
                "IP info response is not an object".to_string(),
            ));
        }

        let field = |keys: &[&str], default: &str| -> String {
            keys.iter()
                .find_map(|key| value.pointer(key).and_then(Value::as_str))
                .filter(|s| !s.is_empty())
                .unwrap_or(default)
                .to_string()
        };

        Ok(Self {
            ip: field(&["/ip", "/query"], "Unknown"),
            country: field(&["/country"], "Unknown"),
            country_code: field(&["/country_code", "/countryCode"], ""),
            region: field(&["/region", "/regionName"], ""),
            city: field(&["/city"], ""),
            isp: field(&["/connection/isp", "/isp"], "Unknown"),
            timezone: field(&["/timezone/id", "/timezone"], ""),
        })
    }
}

/// True when the captive-portal check answers 204 within the timeout
pub async fn check_connectivity() -> bool {
    let client = match reqwest::Client::builder()
        .timeout(CONNECTIVITY_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            log::warn!("Failed to build HTTP client: {e}");
            return false;
        }
    };

    match client.get(CONNECTIVITY_URL).send().await {
        Ok(response) => response.status() == reqwest::StatusCode::NO_CONTENT,
        Err(e) => {
            log::debug!("Connectivity check failed: {e}");
            false
        }
    }
}

/// Look up the exit address through the engine's local SOCKS inbound
pub async fn fetch_ip_info() -> Result<IpInfo> {
    let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{LOCAL_INBOUND_PORT}"))?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(IP_INFO_TIMEOUT)
        .build()?;

    let body = client
        .get(IP_INFO_URL)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    IpInfo::from_json(&body).map_err(|e| {
        log::error!("Failed to parse IP info: {e}");
        TunError::from(e)
    })
}
