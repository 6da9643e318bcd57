//! HTTP client for the chat.z.ai upstream: liveness probes, anonymous
//! credential issuance, catalog fetch, and the chat-completion call itself.
//!
//! Every upstream request wears a full browser header stack; the upstream
//! serves a web frontend, not an API, and rejects anything that does not
//! look like its own pages.

pub mod media;
pub mod signature;
pub mod sse;
pub mod version;

pub use media::{upload_media, MediaKind, UpstreamFile};
pub use signature::generate_signature;
pub use sse::{parse_sse_data, SseStream};
pub use version::FeVersion;

use crate::auth::Claims;
use crate::error::AppError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const BROWSER_UA: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36 Edg/142.0.0.0";
const SEC_CH_UA: &str = r#""Chromium";v="142", "Microsoft Edge";v="142", "Not_A Brand";v="99""#;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);
const CHAT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a single credential liveness probe. Any non-200 outcome and
/// any transport error count as dead.
pub enum ProbeOutcome {
    Alive(Option<Claims>),
    Dead,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamModel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owned_by: String,
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    data: Vec<UpstreamModel>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    id: String,
}

// ── Chat request body ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamChatRequest {
    pub stream: bool,
    pub chat_id: String,
    pub id: String,
    pub model: String,
    pub messages: Vec<UpstreamMessage>,
    pub params: Value,
    pub features: UpstreamFeatures,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<String>,
    pub model_item: ModelItem,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<UpstreamFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamFeatures {
    pub enable_thinking: bool,
    pub web_search: bool,
    pub auto_web_search: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelItem {
    pub id: String,
    pub name: String,
    pub owned_by: String,
}

/// Identity and signature material attached to one chat call.
#[derive(Debug, Clone)]
pub struct SignedContext {
    pub request_id: String,
    pub timestamp_ms: i64,
    pub user_id: String,
    pub signature: String,
}

// ── SSE payload shapes ───────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub data: UpstreamEventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamEventData {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub delta_content: Option<String>,
    #[serde(default)]
    pub edit_content: Option<String>,
    #[serde(default)]
    pub done: Option<bool>,
    #[serde(default)]
    pub usage: Option<UpstreamUsage>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub inner: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// A random public IPv4 for the spoofed X-Forwarded-For / X-Real-IP pair.
pub fn random_public_ipv4() -> String {
    let mut rng = rand::thread_rng();
    loop {
        let a: u8 = rng.gen_range(1..=223);
        let b: u8 = rng.gen();
        // skip loopback, RFC1918 and link-local space
        let reserved = a == 10
            || a == 127
            || (a == 172 && (16..=31).contains(&b))
            || (a == 192 && b == 168)
            || (a == 169 && b == 254);
        if reserved {
            continue;
        }
        return format!("{}.{}.{}.{}", a, b, rng.gen::<u8>(), rng.gen::<u8>());
    }
}

pub struct UpstreamClient {
    http: reqwest::Client,
    chat_http: reqwest::Client,
    base_url: String,
    fe_version: Arc<FeVersion>,
}

impl UpstreamClient {
    pub fn new(base_url: String, fe_version: Arc<FeVersion>) -> Self {
        let http = reqwest::Client::builder()
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        // chat streams have no total deadline, only an idle one
        let chat_http = reqwest::Client::builder()
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(CHAT_IDLE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            chat_http,
            base_url,
            fe_version,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Full browser header stack. A credential rides both as a bearer and
    /// as the `token` cookie; the spoofed client IP pair is fresh per call.
    pub fn browser_headers(
        &self,
        builder: reqwest::RequestBuilder,
        credential: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let ip = random_public_ipv4();
        let mut builder = builder
            .header("User-Agent", BROWSER_UA)
            .header("Accept-Language", "zh-CN,zh;q=0.9,en;q=0.8,en-GB;q=0.7,en-US;q=0.6")
            .header("Cache-Control", "no-cache")
            .header("Pragma", "no-cache")
            .header("DNT", "1")
            .header("Origin", &self.base_url)
            .header("Referer", format!("{}/", self.base_url))
            .header("sec-ch-ua", SEC_CH_UA)
            .header("sec-ch-ua-mobile", "?0")
            .header("sec-ch-ua-platform", "\"Linux\"")
            .header("Sec-Fetch-Dest", "empty")
            .header("Sec-Fetch-Mode", "cors")
            .header("Sec-Fetch-Site", "same-origin")
            .header("sec-gpc", "1")
            .header("X-FE-Version", self.fe_version.get())
            .header("X-Forwarded-For", &ip)
            .header("X-Real-IP", &ip);
        if let Some(credential) = credential {
            builder = builder
                .header("Authorization", format!("Bearer {}", credential))
                .header("Cookie", format!("token={}", credential));
        }
        builder
    }

    /// Liveness probe against the auths endpoint. A 200 is alive; refreshed
    /// claims are returned when the body carries them.
    pub async fn probe_credential(&self, credential: &str) -> ProbeOutcome {
        let request = self
            .browser_headers(
                self.http.get(format!("{}/api/v1/auths/", self.base_url)),
                Some(credential),
            )
            .header("Accept", "application/json")
            .timeout(PROBE_TIMEOUT);

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("credential probe transport error: {}", e);
                return ProbeOutcome::Dead;
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            tracing::debug!("credential probe returned status {}", response.status());
            return ProbeOutcome::Dead;
        }

        match response.json::<AuthResponse>().await {
            Ok(auth) if !auth.token.is_empty() => ProbeOutcome::Alive(Some(Claims {
                id: auth.id,
                email: auth.email,
            })),
            _ => ProbeOutcome::Alive(None),
        }
    }

    /// Anonymous credential from the auths endpoint, used by the model
    /// fetcher and never placed in the pool.
    pub async fn fetch_anonymous_token(&self) -> Result<String, AppError> {
        let response = self
            .http
            .get(format!("{}/api/v1/auths/", self.base_url))
            .header("User-Agent", BROWSER_UA)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::UpstreamStatus {
                status: response.status().as_u16(),
                body: String::new(),
            });
        }
        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| AppError::UpstreamTransport(e.to_string()))?;
        if auth.token.is_empty() {
            return Err(AppError::UpstreamTransport(
                "auths response carried no token".to_string(),
            ));
        }
        Ok(auth.token)
    }

    pub async fn fetch_models(&self, token: &str) -> Result<Vec<UpstreamModel>, AppError> {
        let response = self
            .http
            .get(format!("{}/api/models", self.base_url))
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json")
            .timeout(CATALOG_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::UpstreamStatus {
                status: response.status().as_u16(),
                body: String::new(),
            });
        }
        let catalog: CatalogResponse = response
            .json()
            .await
            .map_err(|e| AppError::UpstreamTransport(e.to_string()))?;
        Ok(catalog.data)
    }

    /// Fire the signed chat-completion request; the caller consumes the SSE
    /// body. Non-2xx statuses surface as `UpstreamStatus` with a bounded
    /// body excerpt.
    pub async fn send_chat(
        &self,
        body: &UpstreamChatRequest,
        credential: &str,
        ctx: &SignedContext,
    ) -> Result<reqwest::Response, AppError> {
        let url = format!("{}/api/chat/completions", self.base_url);
        let request = self
            .browser_headers(self.chat_http.post(&url), Some(credential))
            .header("Accept", "text/event-stream")
            .header("Content-Type", "application/json")
            .header("X-Signature", &ctx.signature)
            .query(&[
                ("timestamp", ctx.timestamp_ms.to_string()),
                ("requestId", ctx.request_id.clone()),
                ("user_id", ctx.user_id.clone()),
                ("token", credential.to_string()),
                ("current_url", format!("{}/c/{}", self.base_url, body.chat_id)),
                ("pathname", format!("/c/{}", body.chat_id)),
                ("signature_timestamp", ctx.timestamp_ms.to_string()),
            ])
            .json(body);

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let excerpt = response.text().await.unwrap_or_default();
            return Err(AppError::UpstreamStatus {
                status: status.as_u16(),
                body: excerpt,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ip_is_public() {
        for _ in 0..200 {
            let ip = random_public_ipv4();
            let octets: Vec<u8> = ip.split('.').map(|o| o.parse().unwrap()).collect();
            assert_eq!(octets.len(), 4);
            assert!((1..=223).contains(&octets[0]));
            assert_ne!(octets[0], 10);
            assert_ne!(octets[0], 127);
            assert!(!(octets[0] == 172 && (16..=31).contains(&octets[1])));
            assert!(!(octets[0] == 192 && octets[1] == 168));
        }
    }

    #[test]
    fn upstream_event_parses_abbreviated_payload() {
        let raw = r#"{"type":"chat:completion","data":{"phase":"answer","delta_content":"hi"}}"#;
        let event: UpstreamEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.kind, "chat:completion");
        assert_eq!(event.data.phase.as_deref(), Some("answer"));
        assert_eq!(event.data.delta_content.as_deref(), Some("hi"));
        assert!(event.data.done.is_none());
    }

    #[test]
    fn chat_request_skips_empty_collections() {
        let body = UpstreamChatRequest {
            stream: true,
            chat_id: "c".to_string(),
            id: "i".to_string(),
            model: "m".to_string(),
            messages: vec![],
            params: serde_json::json!({}),
            features: UpstreamFeatures {
                enable_thinking: true,
                web_search: false,
                auto_web_search: true,
            },
            mcp_servers: vec![],
            model_item: ModelItem {
                id: "m".to_string(),
                name: "M".to_string(),
                owned_by: "z.ai".to_string(),
            },
            files: vec![],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("mcp_servers").is_none());
        assert!(json.get("files").is_none());
        assert_eq!(json["features"]["enable_thinking"], true);
    }
}
