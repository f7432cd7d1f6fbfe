//! Consul-compatible KV adapter over HTTP.
//!
//! Maps the CAS contract onto Consul's KV endpoints:
//! `PUT ?cas=0` for put-if-absent, `DELETE ?cas=<index>` for
//! delete-if-unchanged, and `GET ?keys` for prefix listings.

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::kv::{KvEntry, KvStore};
use crate::KvError;

/// KV store backed by a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulKv {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConsulEntry {
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

impl ConsulKv {
    /// Create an adapter for `endpoint` (e.g. `http://127.0.0.1:8500`).
    #[must_use]
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            token,
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/v1/kv/{key}", self.endpoint)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.header("X-Consul-Token", token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, KvError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| KvError::Unavailable(format!("request to {}: {e}", self.endpoint)))?;
        if resp.status().is_server_error() {
            return Err(KvError::Unavailable(format!(
                "HTTP {} from {}",
                resp.status(),
                self.endpoint
            )));
        }
        Ok(resp)
    }

    async fn bool_body(resp: reqwest::Response) -> Result<bool, KvError> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| KvError::Unavailable(format!("read response body: {e}")))?;
        if !status.is_success() {
            return Err(KvError::Unavailable(format!("HTTP {status}: {text}")));
        }
        parse_bool(&text)
    }
}

fn parse_bool(text: &str) -> Result<bool, KvError> {
    match text.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(KvError::Unavailable(format!("unexpected CAS response {other:?}"))),
    }
}

fn decode_entries(body: &[u8]) -> Result<Option<KvEntry>, KvError> {
    let entries: Vec<ConsulEntry> = serde_json::from_slice(body)
        .map_err(|e| KvError::Unavailable(format!("decode KV entry: {e}")))?;
    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };
    let value = match entry.value {
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| KvError::Unavailable(format!("decode KV value: {e}")))?,
        None => Vec::new(),
    };
    Ok(Some(KvEntry {
        value,
        mod_index: entry.modify_index,
    }))
}

#[async_trait]
impl KvStore for ConsulKv {
    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, KvError> {
        let url = format!("{}?cas=0", self.url(key));
        let resp = self.send(self.request(reqwest::Method::PUT, url).body(value.to_vec())).await?;
        Self::bool_body(resp).await
    }

    async fn read(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        let resp = self.send(self.request(reqwest::Method::GET, self.url(key))).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| KvError::Unavailable(format!("read response body: {e}")))?;
        decode_entries(&body)
    }

    async fn delete_if_unchanged(&self, key: &str, mod_index: u64) -> Result<bool, KvError> {
        let url = format!("{}?cas={mod_index}", self.url(key));
        let resp = self.send(self.request(reqwest::Method::DELETE, url)).await?;
        Self::bool_body(resp).await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let url = format!("{}?keys", self.url(prefix));
        let resp = self.send(self.request(reqwest::Method::GET, url)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        resp.json::<Vec<String>>()
            .await
            .map_err(|e| KvError::Unavailable(format!("decode key listing: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_entries_reads_value_and_index() {
        // "aGk=" is base64 for "hi".
        let body = br#"[{"Key":"n/1","Value":"aGk=","ModifyIndex":42,"CreateIndex":42,"Flags":0}]"#;
        match decode_entries(body) {
            Ok(Some(entry)) => {
                assert_eq!(entry.value, b"hi");
                assert_eq!(entry.mod_index, 42);
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn decode_entries_accepts_null_value() {
        let body = br#"[{"Key":"n/1","Value":null,"ModifyIndex":7}]"#;
        match decode_entries(body) {
            Ok(Some(entry)) => {
                assert!(entry.value.is_empty());
                assert_eq!(entry.mod_index, 7);
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn parse_bool_rejects_garbage() {
        assert!(matches!(parse_bool("true\n"), Ok(true)));
        assert!(matches!(parse_bool("false"), Ok(false)));
        assert!(matches!(parse_bool("<html>"), Err(KvError::Unavailable(_))));
    }

    #[test]
    fn url_strips_trailing_slash() {
        let kv = ConsulKv::new("http://127.0.0.1:8500/", None);
        assert_eq!(kv.url("node/1"), "http://127.0.0.1:8500/v1/kv/node/1");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        // Port 9 (discard) is not expected to have an HTTP listener.
        let kv = ConsulKv::new("http://127.0.0.1:9", None);
        assert!(matches!(kv.put_if_absent("n/1", b"").await, Err(KvError::Unavailable(_))));
    }
}
