use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use super::protocol::{ActionResponse, AgentRegistration, Heartbeat, Identity, PollResponse};
use crate::config::is_loopback;

/// The remote control plane as seen by the poller
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch pending actions queued since `last_poll`
    async fn poll(&self, identity: &Identity, last_poll: Option<DateTime<Utc>>) -> Result<PollResponse>;

    async fn submit_result(&self, identity: &Identity, response: &ActionResponse) -> Result<()>;

    async fn register(&self, identity: &Identity, registration: &AgentRegistration) -> Result<Value>;

    async fn heartbeat(&self, identity: &Identity, heartbeat: &Heartbeat) -> Result<Value>;

    async fn unregister(&self, identity: &Identity) -> Result<Value>;

    async fn info(&self, identity: &Identity) -> Result<Value>;
}

/// HTTP client for the control-plane agent API
pub struct RemoteClient {
    client: Client,
    endpoint: String,
}

impl RemoteClient {
    /// Create a client for `endpoint`; HTTPS is required unless the host is loopback
    pub fn new(endpoint: &str) -> Result<Self> {
        let url = url::Url::parse(endpoint).context("Invalid control plane endpoint")?;
        let loopback = is_loopback(&url);

        if url.scheme() != "https" && !(url.scheme() == "http" && loopback) {
            anyhow::bail!(
                "Control plane endpoint must use HTTPS (got: {})",
                url.scheme()
            );
        }

        let client = Client::builder()
            .user_agent(format!("relay-agent/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .https_only(!loopback)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/agent/{}", self.endpoint, path)
    }

    fn authorized(&self, request: RequestBuilder, identity: &Identity) -> RequestBuilder {
        request
            .bearer_auth(&identity.token)
            .header("X-User-ID", &identity.user_id)
            .header("X-Community-ID", &identity.community_id)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach control plane ({what})"))?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                anyhow::bail!(
                    "Access denied ({}) for {}. The session may have been revoked.",
                    response.status(),
                    what
                )
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("Control plane returned {} for {}: {}", status, what, body.trim())
            }
        }
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = self.send(request, what).await?;
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read {what} response"))?;

        if bytes.is_empty() {
            return serde_json::from_value(Value::Null).with_context(|| format!("Empty {what} response"));
        }
        serde_json::from_slice(&bytes).with_context(|| format!("Failed to decode {what} response"))
    }
}

#[async_trait::async_trait]
impl ControlPlane for RemoteClient {
    async fn poll(&self, identity: &Identity, last_poll: Option<DateTime<Utc>>) -> Result<PollResponse> {
        let mut request = self.authorized(self.client.get(self.url("poll")), identity);
        if let Some(last_poll) = last_poll {
            request = request.query(&[("last_poll", last_poll.to_rfc3339())]);
        }

        let response: PollResponse = self.json(request, "poll").await?;
        tracing::debug!(
            actions = response.actions.len(),
            has_more = response.has_more,
            "Poll response received"
        );
        Ok(response)
    }

    async fn submit_result(&self, identity: &Identity, response: &ActionResponse) -> Result<()> {
        let request = self
            .authorized(self.client.post(self.url(&format!("actions/{}/result", response.id))), identity)
            .json(response);
        self.send(request, "result submission").await?;
        Ok(())
    }

    async fn register(&self, identity: &Identity, registration: &AgentRegistration) -> Result<Value> {
        let request = self
            .authorized(self.client.post(self.url("register")), identity)
            .json(registration);
        self.json(request, "registration").await
    }

    async fn heartbeat(&self, identity: &Identity, heartbeat: &Heartbeat) -> Result<Value> {
        let request = self
            .authorized(self.client.post(self.url("heartbeat")), identity)
            .json(heartbeat);
        self.json(request, "heartbeat").await
    }

    async fn unregister(&self, identity: &Identity) -> Result<Value> {
        let request = self.authorized(self.client.delete(self.url("register")), identity);
        self.json(request, "unregistration").await
    }

    async fn info(&self, identity: &Identity) -> Result<Value> {
        let request = self.authorized(self.client.get(self.url("info")), identity);
        self.json(request, "info").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    fn identity() -> Identity {
        Identity {
            token: "tok".to_string(),
            user_id: "u1".to_string(),
            community_id: "c1".to_string(),
        }
    }

    fn check_headers(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer tok")
            && headers.get("x-user-id").and_then(|v| v.to_str().ok()) == Some("u1")
            && headers.get("x-community-id").and_then(|v| v.to_str().ok()) == Some("c1")
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn rejects_plain_http_to_remote_host() {
        assert!(RemoteClient::new("http://control.example.com").is_err());
    }

    #[test]
    fn accepts_https_and_loopback_http() {
        assert!(RemoteClient::new("https://control.example.com").is_ok());
        assert!(RemoteClient::new("http://127.0.0.1:9000").is_ok());
        assert!(RemoteClient::new("http://localhost:9000/").is_ok());
    }

    #[test]
    fn rejects_invalid_url() {
        assert!(RemoteClient::new("not-a-url").is_err());
    }

    #[tokio::test]
    async fn poll_sends_identity_and_last_poll() {
        let router = Router::new().route(
            "/api/v1/agent/poll",
            get(|headers: HeaderMap, Query(query): Query<HashMap<String, String>>| async move {
                if !check_headers(&headers) || !query.contains_key("last_poll") {
                    return Json(json!({"actions": [], "has_more": false}));
                }
                Json(json!({
                    "actions": [{
                        "id": "a1",
                        "module_name": "system",
                        "action": "ping",
                        "created_at": "2026-01-01T00:00:00Z",
                        "expires_at": "2099-01-01T00:00:00Z"
                    }],
                    "has_more": true,
                    "poll_count": 4
                }))
            }),
        );
        let client = RemoteClient::new(&serve(router).await).unwrap();

        let response = client.poll(&identity(), Some(Utc::now())).await.unwrap();
        assert_eq!(response.actions.len(), 1);
        assert!(response.has_more);
        assert_eq!(response.poll_count, 4);
    }

    #[tokio::test]
    async fn submit_result_posts_to_action_path() {
        let router = Router::new().route(
            "/api/v1/agent/actions/:id/result",
            post(|Path(id): Path<String>, Json(body): Json<Value>| async move {
                if id == "a1" && body["success"] == json!(true) {
                    axum::http::StatusCode::OK
                } else {
                    axum::http::StatusCode::BAD_REQUEST
                }
            }),
        );
        let client = RemoteClient::new(&serve(router).await).unwrap();

        let response = ActionResponse::success("a1", crate::modules::Params::new(), 3);
        client.submit_result(&identity(), &response).await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_is_reported() {
        let router = Router::new().route(
            "/api/v1/agent/info",
            get(|| async { axum::http::StatusCode::UNAUTHORIZED }),
        );
        let client = RemoteClient::new(&serve(router).await).unwrap();

        let err = client.info(&identity()).await.unwrap_err();
        assert!(err.to_string().contains("Access denied"));
    }

    #[tokio::test]
    async fn undecodable_body_is_an_error() {
        let router = Router::new().route("/api/v1/agent/poll", get(|| async { "not json" }));
        let client = RemoteClient::new(&serve(router).await).unwrap();

        assert!(client.poll(&identity(), None).await.is_err());
    }
}
