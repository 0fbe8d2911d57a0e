//! # Balance Authority: Tenant Balance Lookup
//!
//! The metering engine asks the platform's account service for an
//! organization's spendable balance after charging a running worker. A
//! negative figure triggers a forced scale-to-zero.
//!
//! ## Protocol
//!
//! `GET {api_url}/api/internal/v1/org/{org_id}/balance`, signed with
//! HMAC-SHA256 of `"{METHOD}\n{PATH}\n{UNIX_TIMESTAMP}"` keyed by the shared
//! internal service key:
//!
//! | Header | Value |
//! |--------|-------|
//! | `X-Service-Name` | calling service name |
//! | `X-Timestamp` | unix seconds |
//! | `X-Signature` | lowercase hex digest |
//!
//! The response envelope is `{code, message, data}`; `code != 200` is an
//! error even on HTTP 200. Amounts are micro-units.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;

use crate::config::BalanceConfig;
use crate::error::RemoteError;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_SERVICE_NAME: &str = "X-Service-Name";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Signature";

/// Read-only balance lookup keyed by organization.
#[async_trait]
pub trait BalanceAuthority: Send + Sync {
    /// Signed total available to spend, in micro-units.
    async fn total_available(&self, org_id: &str) -> Result<i64, RemoteError>;
}

/// Hex HMAC-SHA256 over `METHOD\nPATH\nTIMESTAMP`.
pub fn sign(method: &str, path: &str, timestamp: i64, secret: &str) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{method}\n{path}\n{timestamp}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Deserialize)]
struct BalanceEnvelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: BalanceData,
}

#[derive(Debug, Default, Deserialize)]
struct BalanceData {
    #[serde(default)]
    balance: i64,
    #[serde(default)]
    reward_balance: i64,
    #[serde(default)]
    credit_limit: i64,
    #[serde(default)]
    total_available: Option<i64>,
}

impl BalanceData {
    /// `total_available` when the authority reports a non-zero figure,
    /// otherwise the sum of the components.
    fn total(&self) -> i64 {
        match self.total_available {
            Some(total) if total != 0 => total,
            _ => self
                .balance
                .saturating_add(self.reward_balance)
                .saturating_add(self.credit_limit),
        }
    }
}

fn decode_balance(body: &str) -> Result<i64, RemoteError> {
    let envelope: BalanceEnvelope =
        serde_json::from_str(body).map_err(|e| RemoteError::Decode(e.to_string()))?;
    if envelope.code != 200 {
        return Err(RemoteError::Status {
            status: u16::try_from(envelope.code).unwrap_or(0),
            body: envelope.message,
        });
    }
    Ok(envelope.data.total())
}

pub struct HttpBalanceAuthority {
    http: reqwest::Client,
    api_url: String,
    service_name: String,
    internal_key: String,
}

impl HttpBalanceAuthority {
    pub fn new(api_url: &str, service_name: &str, internal_key: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpBalanceAuthority {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            service_name: service_name.to_string(),
            internal_key: internal_key.to_string(),
        })
    }

    /// `None` when no balance authority is configured.
    pub fn from_config(config: &BalanceConfig) -> anyhow::Result<Option<Self>> {
        match config.api_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => Ok(Some(Self::new(
                url,
                &config.service_name,
                &config.internal_key,
                Duration::from_secs(config.timeout_secs),
            )?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BalanceAuthority for HttpBalanceAuthority {
    async fn total_available(&self, org_id: &str) -> Result<i64, RemoteError> {
        let path = format!(
            "/api/internal/v1/org/{}/balance",
            urlencoding::encode(org_id)
        );
        let timestamp = chrono::Utc::now().timestamp();
        let signature = sign("GET", &path, timestamp, &self.internal_key);

        let resp = self
            .http
            .get(format!("{}{}", self.api_url, path))
            .header(HEADER_SERVICE_NAME, &self.service_name)
            .header(HEADER_TIMESTAMP, timestamp.to_string())
            .header(HEADER_SIGNATURE, signature)
            .header("Accept", "application/json")
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        decode_balance(&body)
    }
}
