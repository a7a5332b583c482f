//! HTTP client for the proposal directory service
//!
//! Besides proposal lookup, the directory accepts per-session traffic
//! reports at `POST {base}/sessions/{id}/stats`. Requests are unsigned.

use super::{DiscoveryError, ProposalResolver, ServiceProposal};
use crate::identity::Identity;
use crate::stats::{SessionStats, StatsReporter};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ProposalsResponse {
    #[serde(default)]
    proposals: Vec<ServiceProposal>,
}

/// Directory service client
pub struct DiscoveryClient {
    http: Client,
    base_url: String,
}

impl DiscoveryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(http, base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_stats_url(&self, session_id: &str) -> String {
        format!("{}/sessions/{}/stats", self.base_url, session_id)
    }
}

/// Reads the body and turns non-2xx responses into `DiscoveryError::Status`
async fn checked_body(response: Response) -> Result<String, DiscoveryError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        error!("Directory request failed with {}: {}", status, body);
        return Err(DiscoveryError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

#[async_trait]
impl ProposalResolver for DiscoveryClient {
    async fn find_proposals(
        &self,
        provider: &Identity,
    ) -> Result<Vec<ServiceProposal>, DiscoveryError> {
        let url = format!("{}/proposals", self.base_url);
        debug!("Fetching proposals of {} from {}", provider, url);

        let response = self
            .http
            .get(&url)
            .query(&[("node_key", provider.address())])
            .send()
            .await?;

        let body = checked_body(response).await?;
        let parsed = parse_proposals(&body)?;
        info!("Fetched {} proposals for {}", parsed.len(), provider);
        Ok(parsed)
    }
}

#[async_trait]
impl StatsReporter for DiscoveryClient {
    async fn send_session_stats(
        &self,
        session_id: &str,
        stats: SessionStats,
    ) -> Result<(), DiscoveryError> {
        let response = self
            .http
            .post(self.session_stats_url(session_id))
            .json(&stats)
            .send()
            .await?;
        checked_body(response).await?;

        info!("Session stats sent: {}", session_id);
        Ok(())
    }
}

fn parse_proposals(body: &str) -> Result<Vec<ServiceProposal>, DiscoveryError> {
    let response: ProposalsResponse = serde_json::from_str(body)?;
    Ok(response.proposals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts one HTTP request, answers with `status_line` and returns the
    /// request head and body
    async fn serve_once(listener: TcpListener, status_line: &str) -> (String, String) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        let head_end = loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before request head");
            request.extend_from_slice(&buf[..n]);
            if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&request[..head_end]).to_string();
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().unwrap())
            })
            .unwrap_or(0);
        while request.len() < head_end + content_length {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before request body");
            request.extend_from_slice(&buf[..n]);
        }
        let body = String::from_utf8_lossy(&request[head_end..]).to_string();

        let response = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line);
        stream.write_all(response.as_bytes()).await.unwrap();
        (head, body)
    }

    #[test]
    fn test_session_stats_url() {
        let client = DiscoveryClient::new("https://directory.example/v1/");
        assert_eq!(
            client.session_stats_url("sess-1"),
            "https://directory.example/v1/sessions/sess-1/stats"
        );
    }

    #[tokio::test]
    async fn test_send_session_stats_posts_counters() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, "200 OK"));
        let client = DiscoveryClient::new(format!("http://127.0.0.1:{}/v1", port));

        client
            .send_session_stats(
                "sess-1",
                SessionStats {
                    bytes_sent: 4600,
                    bytes_received: 3200,
                },
            )
            .await
            .unwrap();

        let (head, body) = server.await.unwrap();
        assert!(head.starts_with("POST /v1/sessions/sess-1/stats HTTP/1.1\r\n"));
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&body).unwrap(),
            serde_json::json!({ "bytes_sent": 4600, "bytes_received": 3200 })
        );
    }

    #[tokio::test]
    async fn test_send_session_stats_rejected() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, "404 Not Found"));
        let client = DiscoveryClient::new(format!("http://127.0.0.1:{}", port));

        let err = client
            .send_session_stats("gone", SessionStats::default())
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::Status { status: 404, .. }));
        server.await.unwrap();
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = DiscoveryClient::new("https://directory.example/v1/");
        assert_eq!(client.base_url(), "https://directory.example/v1");
    }

    #[test]
    fn test_parse_proposals_response() {
        let body = r#"{"proposals": [
            {"id": 1, "provider_id": "node-1", "service_type": "openvpn",
             "provider_contacts": [{"type": "http/v1", "definition": {"address": "http://a"}}]}
        ]}"#;

        let proposals = parse_proposals(body).unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].provider_id, "node-1");
    }

    #[test]
    fn test_parse_empty_response() {
        assert!(parse_proposals("{}").unwrap().is_empty());
        assert!(parse_proposals(r#"{"proposals": []}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_invalid_response() {
        let err = parse_proposals("not json").unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidResponse(_)));
    }
}
