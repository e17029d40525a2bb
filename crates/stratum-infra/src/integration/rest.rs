//! Generic JSON-over-HTTP integration adapter.
//!
//! Every action is a `POST {base_url}/actions/{action}` whose JSON body is
//! the step's resolved parameters. The remote answers with one of:
//!
//! - a number: the count
//! - an array: the records
//! - an object with `count` and/or `records`
//!
//! The API key is wrapped in [`SecretString`] and only exposed when building
//! the `Authorization` header.

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use stratum_core::integration::AdapterError;
use stratum_core::integration::adapter::IntegrationAdapter;
use stratum_types::config::IntegrationConfig;
use stratum_types::integration::IntegrationResult;

/// Longest slice of a remote error body carried into the step log.
const MAX_ERROR_BODY: usize = 512;

pub struct RestIntegrationAdapter {
    client: reqwest::Client,
    id: String,
    platform_type: String,
    base_url: String,
    api_key: Option<SecretString>,
}

impl RestIntegrationAdapter {
    pub fn new(
        client: reqwest::Client,
        id: String,
        platform_type: String,
        base_url: String,
        api_key: Option<SecretString>,
    ) -> Self {
        Self {
            client,
            id,
            platform_type,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Build from config, reading the API key from `api_key_env` if set.
    pub fn from_config(config: &IntegrationConfig, client: reqwest::Client) -> Self {
        let api_key = config.api_key_env.as_deref().and_then(|var| {
            match std::env::var(var) {
                Ok(value) if !value.is_empty() => Some(SecretString::from(value)),
                _ => {
                    tracing::warn!(
                        integration = config.id.as_str(),
                        env = var,
                        "API key environment variable is not set"
                    );
                    None
                }
            }
        });

        Self::new(
            client,
            config.id.clone(),
            config.platform_type.clone(),
            config.base_url.clone(),
            api_key,
        )
    }

    fn action_url(&self, action: &str) -> Result<String, AdapterError> {
        let valid = !action.is_empty()
            && action
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(AdapterError::UnsupportedAction {
                integration: self.id.clone(),
                action: action.to_string(),
            });
        }
        Ok(format!("{}/actions/{action}", self.base_url))
    }
}

impl IntegrationAdapter for RestIntegrationAdapter {
    fn platform_type(&self) -> &str {
        &self.platform_type
    }

    async fn invoke(
        &self,
        action: &str,
        parameters: &Value,
    ) -> Result<IntegrationResult, AdapterError> {
        let url = self.action_url(action)?;

        let mut request = self.client.post(&url).json(parameters);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::Network(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = truncate(body.trim(), MAX_ERROR_BODY);
            let detail = if body.is_empty() {
                String::new()
            } else {
                format!(": {body}")
            };
            return Err(match status.as_u16() {
                code @ (401 | 403) => {
                    AdapterError::Auth(format!("{} rejected credentials ({code}){detail}", self.id))
                }
                404 => AdapterError::Remote {
                    status: 404,
                    message: format!("{} has no action '{action}'{detail}", self.id),
                },
                code => AdapterError::Remote {
                    status: code,
                    message: body,
                },
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Other(format!("invalid JSON from {}: {e}", self.id)))?;

        tracing::debug!(
            integration = self.id.as_str(),
            action,
            status = status.as_u16(),
            "integration call succeeded"
        );

        parse_response(body)
    }
}

/// Interpret a response body as an [`IntegrationResult`].
pub fn parse_response(body: Value) -> Result<IntegrationResult, AdapterError> {
    match body {
        Value::Null => Ok(IntegrationResult::default()),
        Value::Number(n) => n
            .as_u64()
            .map(IntegrationResult::count)
            .ok_or_else(|| AdapterError::Other(format!("count must be a non-negative integer, got {n}"))),
        Value::Array(records) => Ok(IntegrationResult::records(records)),
        Value::Object(map) if map.contains_key("count") || map.contains_key("records") => {
            serde_json::from_value(Value::Object(map))
                .map_err(|e| AdapterError::Other(format!("unexpected response shape: {e}")))
        }
        other => Err(AdapterError::Other(format!(
            "unexpected response shape: {}",
            truncate(&other.to_string(), 80)
        ))),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Accept one connection, capture the raw request, answer with `status`/`body`.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                    let len = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + len {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    fn adapter(base_url: String, key: Option<&str>) -> RestIntegrationAdapter {
        RestIntegrationAdapter::new(
            reqwest::Client::new(),
            "crm".to_string(),
            "rest".to_string(),
            base_url,
            key.map(|k| SecretString::from(k.to_string())),
        )
    }

    #[test]
    fn test_parse_response_shapes() {
        assert_eq!(parse_response(json!(12)).unwrap(), IntegrationResult::count(12));
        assert_eq!(
            parse_response(json!([{"id": 1}])).unwrap(),
            IntegrationResult::records(vec![json!({"id": 1})])
        );
        let both = parse_response(json!({"count": 2, "records": [{"id": 1}, {"id": 2}]})).unwrap();
        assert_eq!(both.count, Some(2));
        assert_eq!(both.records.map(|r| r.len()), Some(2));
        assert_eq!(parse_response(Value::Null).unwrap(), IntegrationResult::default());
        assert!(parse_response(json!("ok")).is_err());
        assert!(parse_response(json!(-1)).is_err());
    }

    #[test]
    fn test_invalid_action_name_is_unsupported() {
        let adapter = adapter("http://localhost:1".to_string(), None);
        assert!(matches!(
            adapter.action_url("../admin"),
            Err(AdapterError::UnsupportedAction { .. })
        ));
        assert_eq!(
            adapter.action_url("count_leads").unwrap(),
            "http://localhost:1/actions/count_leads"
        );
    }

    #[tokio::test]
    async fn test_invoke_posts_parameters_with_bearer_key() {
        let (url, server) = serve_once("200 OK", "{\"count\": 7}").await;
        let adapter = adapter(format!("{url}/"), Some("s3cret"));

        let result = adapter
            .invoke("count_leads", &json!({"since": "2026-03-01"}))
            .await
            .unwrap();
        assert_eq!(result, IntegrationResult::count(7));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /actions/count_leads HTTP/1.1"));
        assert!(request.to_lowercase().contains("authorization: bearer s3cret"));
        assert!(request.contains("\"since\":\"2026-03-01\""));
    }

    #[tokio::test]
    async fn test_invoke_maps_error_statuses() {
        let (url, _server) = serve_once("500 Internal Server Error", "{\"error\":\"boom\"}").await;
        let err = adapter(url, None).invoke("list", &json!({})).await.unwrap_err();
        assert_eq!(
            err,
            AdapterError::Remote {
                status: 500,
                message: "{\"error\":\"boom\"}".to_string()
            }
        );

        let (url, _server) = serve_once("401 Unauthorized", "{\"error\":\"token expired\"}").await;
        let err = adapter(url, None).invoke("list", &json!({})).await.unwrap_err();
        assert_eq!(
            err,
            AdapterError::Auth("crm rejected credentials (401): {\"error\":\"token expired\"}".to_string())
        );

        let (url, _server) = serve_once("403 Forbidden", "").await;
        let err = adapter(url, None).invoke("list", &json!({})).await.unwrap_err();
        assert_eq!(err, AdapterError::Auth("crm rejected credentials (403)".to_string()));

        let (url, _server) = serve_once("404 Not Found", "{\"error\":\"no such action\"}").await;
        let err = adapter(url, None).invoke("purge", &json!({})).await.unwrap_err();
        assert_eq!(
            err,
            AdapterError::Remote {
                status: 404,
                message: "crm has no action 'purge': {\"error\":\"no such action\"}".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_invoke_unreachable_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = adapter(format!("http://{addr}"), None)
            .invoke("list", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Network(_)));
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("short", 10), "short");
    }
}
