//! Cloudflare Workers KV client

use std::time::Duration;

use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use super::error::{StoreError, StoreResult};
use super::{KeyEntry, ObjectStore, PutResponse};
use crate::ensure;
use crate::error::Result;

/// Public API root
pub const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";

/// Whole-request limit; a full chunk over a 512 kbit/s uplink fits in it
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials and namespace selection for Workers KV
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Email of the Cloudflare account
    #[serde(default)]
    pub email: String,
    /// "Account ID" on the dashboard
    #[serde(default, rename = "account")]
    pub account_id: String,
    /// "Namespace ID" of the Workers KV namespace
    #[serde(default)]
    pub namespace: String,
    /// Global API key, used when no token is set
    #[serde(default)]
    pub key: String,
    /// Scoped API token
    #[serde(default)]
    pub token: String,
}

impl Account {
    /// Check that every field needed to reach the store is present
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.email.is_empty() {
            missing.push("Email is empty. Set `email` in the preferences file or pass --email.");
        }
        if self.namespace.is_empty() {
            missing.push(
                "Namespace is empty. Set `namespace` in the preferences file or pass --namespace.",
            );
        }
        if self.account_id.is_empty() {
            missing.push(
                "Account is empty. Set `account` in the preferences file or pass --account.",
            );
        }
        if self.key.is_empty() && self.token.is_empty() {
            missing.push(
                "Key and token are both empty. Set one in the preferences file or pass --key/--token.",
            );
        }

        ensure!(
            missing.is_empty(),
            Config,
            "account settings did not validate:\n{}",
            missing.join("\n")
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

/// Workers KV namespace accessed over the REST API
pub struct CloudflareKv {
    account: Account,
    base_url: String,
    client: Client,
}

impl CloudflareKv {
    /// Client for the public API
    pub fn new(account: Account, timeout: Duration) -> StoreResult<Self> {
        Self::with_base_url(account, CLOUDFLARE_API, timeout)
    }

    /// Client for an alternative API root. `timeout` bounds each request,
    /// upload of the body included.
    pub fn with_base_url(
        account: Account,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> StoreResult<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            account,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn namespace_url(&self) -> String {
        format!(
            "{}/accounts/{}/storage/kv/namespaces/{}",
            self.base_url, self.account.account_id, self.account.namespace
        )
    }

    fn value_url(&self, key: &str) -> String {
        format!("{}/values/{}", self.namespace_url(), key)
    }

    // Token wins over the global key
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = if !self.account.token.is_empty() {
            request.bearer_auth(&self.account.token)
        } else {
            request.header("X-Auth-Key", &self.account.key)
        };
        request.header("X-Auth-Email", &self.account.email)
    }

    fn check_status(response: Response) -> StoreResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .unwrap_or_else(|_| "Unable to read error message".to_string());
        Err(StoreError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

impl ObjectStore for CloudflareKv {
    fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        metadata: &serde_json::Value,
    ) -> StoreResult<PutResponse> {
        let url = self.value_url(key);
        tracing::debug!("PUT {} ({} bytes)", url, value.len());

        let form = Form::new()
            .part("value", Part::bytes(value))
            .text("metadata", metadata.to_string());
        let response = self
            .authorize(self.client.put(&url))
            .multipart(form)
            .send()?;

        // Rejections come back as an envelope with success = false, so the
        // body is parsed whatever the status.
        let status = response.status();
        let body = response.text()?;
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(&body).map_err(|e| {
            StoreError::Malformed(format!("status {}: {}: {}", status.as_u16(), e, body))
        })?;

        if !envelope.success {
            tracing::debug!("PUT {} rejected: {}", key, body);
        }
        Ok(PutResponse {
            success: envelope.success,
            errors: envelope
                .errors
                .into_iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect(),
        })
    }

    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let url = self.value_url(key);
        tracing::debug!("GET {}", url);

        let response = self.authorize(self.client.get(&url)).send()?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let response = Self::check_status(response)?;
        Ok(response.bytes()?.to_vec())
    }

    fn list_keys(&self) -> StoreResult<Vec<KeyEntry>> {
        let url = format!("{}/keys", self.namespace_url());
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut request = self.authorize(self.client.get(&url));
            if let Some(cursor) = &cursor {
                request = request.query(&[("cursor", cursor.as_str())]);
            }
            tracing::debug!("GET {} (cursor {:?})", url, cursor);

            let response = Self::check_status(request.send()?)?;
            let envelope: Envelope<Vec<KeyEntry>> = response.json()?;
            if !envelope.success {
                let errors: Vec<String> = envelope.errors.into_iter().map(|e| e.message).collect();
                return Err(StoreError::Api {
                    status: 200,
                    body: errors.join("; "),
                });
            }

            keys.extend(envelope.result.unwrap_or_default());
            cursor = envelope
                .result_info
                .and_then(|info| info.cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        tracing::info!("listed {} keys", keys.len());
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    use crate::uploader::CHUNK_MAX;

    fn account() -> Account {
        Account {
            email: "me@example.com".to_string(),
            account_id: "acct".to_string(),
            namespace: "ns".to_string(),
            key: String::new(),
            token: "tok".to_string(),
        }
    }

    #[test]
    fn test_validate_lists_every_missing_field() {
        assert!(account().validate().is_ok());

        let err = Account::default().validate().unwrap_err().to_string();
        assert!(err.contains("Email"));
        assert!(err.contains("Namespace"));
        assert!(err.contains("Account"));
        assert!(err.contains("token"));
    }

    #[test]
    fn test_key_alone_is_enough() {
        let mut acct = account();
        acct.token.clear();
        acct.key = "global".to_string();
        assert!(acct.validate().is_ok());
    }

    #[test]
    fn test_urls() -> StoreResult<()> {
        let kv = CloudflareKv::with_base_url(
            account(),
            "http://localhost:8787/",
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        assert_eq!(
            kv.value_url("abc1"),
            "http://localhost:8787/accounts/acct/storage/kv/namespaces/ns/values/abc1"
        );
        Ok(())
    }

    #[test]
    fn test_default_timeout_fits_a_full_chunk() {
        // 24 MiB at 512 kbit/s
        let slow_upload = Duration::from_secs((CHUNK_MAX as u64 * 8).div_ceil(512_000));
        assert!(DEFAULT_REQUEST_TIMEOUT >= slow_upload);
    }

    #[test]
    fn test_request_gives_up_after_timeout() -> StoreResult<()> {
        // Accepts connections through the backlog but never answers
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let kv = CloudflareKv::with_base_url(
            account(),
            format!("http://{}", addr),
            Duration::from_millis(300),
        )?;

        let started = Instant::now();
        let result = kv.get("abc");
        assert!(matches!(result, Err(StoreError::Request(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn test_envelope_parsing() {
        let body = r#"{"success":false,"errors":[{"code":10001,"message":"bad"}],"messages":[],"result":null}"#;
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(body).unwrap();
        assert!(!envelope.success);
        assert_eq!(envelope.errors[0].message, "bad");

        let body = r#"{"success":true,"errors":[],"result":[{"name":"k","metadata":{"hash":"k"}}],"result_info":{"count":1,"cursor":""}}"#;
        let envelope: Envelope<Vec<KeyEntry>> = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.result.unwrap()[0].name, "k");
        assert_eq!(envelope.result_info.unwrap().cursor.as_deref(), Some(""));
    }
}
