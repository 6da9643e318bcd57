//! OpenAI chat request → signed upstream request.
//!
//! Pipeline order matters: model resolution, tool-prompt injection, media
//! side-channel, then identity/signature and body assembly. Tool and media
//! failures degrade the request instead of failing it; only an unknown
//! model or an empty credential pool is fatal.

use crate::auth::CredentialPool;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::{ChatCompletionRequest, Message, MessageContent};
use crate::registry::{ModelMapping, ModelRegistry};
use crate::tokenizer;
use crate::tools;
use crate::upstream::{
    self, generate_signature, MediaKind, ModelItem, SignedContext, UpstreamChatRequest,
    UpstreamClient, UpstreamFeatures, UpstreamFile, UpstreamMessage,
};
use rand::Rng;
use tracing::{debug, warn};

pub struct TranslatedRequest {
    pub body: UpstreamChatRequest,
    pub credential: String,
    pub ctx: SignedContext,
    pub mapping: ModelMapping,
    /// Heuristic prompt-side token estimate over the translated messages
    /// and tools, used when the upstream reports no usage.
    pub prompt_tokens: u64,
    pub multimodal: bool,
}

pub async fn translate_request(
    req: &ChatCompletionRequest,
    registry: &ModelRegistry,
    pool: &CredentialPool,
    client: &UpstreamClient,
    cfg: &AppConfig,
) -> Result<TranslatedRequest, AppError> {
    let mapping = registry
        .resolve(&req.model)
        .ok_or_else(|| AppError::UnknownModel(req.model.clone()))?;

    let tool_list = req.tools.as_deref().unwrap_or(&[]);
    let mut messages = tools::process_messages_with_tools(
        &req.messages,
        tool_list,
        req.tool_choice.as_ref(),
        cfg.tool_support,
    );

    let credential = pool.acquire().ok_or(AppError::NoCredentials)?;

    let (files, multimodal) = upload_inline_media(&mut messages, client, pool).await;

    let request_id = uuid::Uuid::new_v4().to_string();
    let timestamp_ms = chrono::Utc::now().timestamp_millis();
    let user_id = pool
        .claims_for(&credential)
        .filter(|c| !c.id.is_empty())
        .map(|c| c.id)
        .unwrap_or_else(|| format!("guest-user-{}", rand::thread_rng().gen_range(100_000..1_000_000)));

    let last_user_content = messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content_text())
        .unwrap_or_default();
    let signature = generate_signature(&user_id, &request_id, &last_user_content, timestamp_ms);

    let prompt_tokens = tokenizer::count_request_tokens(&messages, tool_list);

    let upstream_messages: Vec<UpstreamMessage> = messages
        .iter()
        .map(|m| UpstreamMessage {
            role: m.role.clone(),
            content: m.content_text(),
        })
        .collect();

    let body = UpstreamChatRequest {
        stream: true,
        chat_id: uuid::Uuid::new_v4().to_string(),
        id: request_id.clone(),
        model: mapping.upstream_model_id.clone(),
        messages: upstream_messages,
        params: serde_json::json!({}),
        features: UpstreamFeatures {
            enable_thinking: mapping.enable_thinking,
            web_search: mapping.web_search,
            auto_web_search: mapping.auto_web_search,
        },
        mcp_servers: mapping.mcp_servers.clone(),
        model_item: ModelItem {
            id: mapping.upstream_model_id.clone(),
            name: mapping.upstream_model_name.clone(),
            owned_by: mapping.owned_by.clone(),
        },
        files,
    };

    Ok(TranslatedRequest {
        body,
        credential,
        ctx: SignedContext {
            request_id,
            timestamp_ms,
            user_id,
            signature,
        },
        mapping,
        prompt_tokens,
        multimodal,
    })
}

/// Walk messages for inline media parts, upload each through the side
/// channel, and strip the parts from the message. Each upload draws its own
/// credential from the pool. Upload failures drop the part, never the
/// request.
async fn upload_inline_media(
    messages: &mut [Message],
    client: &UpstreamClient,
    pool: &CredentialPool,
) -> (Vec<UpstreamFile>, bool) {
    let mut files = Vec::new();
    let mut saw_media = false;

    for message in messages.iter_mut() {
        let Some(MessageContent::Parts(parts)) = &mut message.content else {
            continue;
        };

        let mut kept = Vec::with_capacity(parts.len());
        for part in parts.drain(..) {
            let media = match part.kind.as_str() {
                "image_url" => part.image_url.as_ref().map(|u| (u.url.clone(), MediaKind::Image)),
                "video_url" => part.video_url.as_ref().map(|u| (u.url.clone(), MediaKind::Video)),
                _ => None,
            };
            let Some((url, kind)) = media else {
                kept.push(part);
                continue;
            };

            saw_media = true;
            let Some(upload_credential) = pool.acquire() else {
                warn!("no credential available for media upload, dropping part");
                continue;
            };
            match upstream::upload_media(client, &upload_credential, &url, kind).await {
                Ok(Some(file)) => {
                    debug!("media part replaced with upstream file {}", file.id);
                    files.push(file);
                }
                Ok(None) => debug!("media part skipped (no-content url)"),
                Err(e) => warn!("media upload failed, dropping part: {}", e),
            }
        }
        *parts = kept;
    }

    (files, saw_media)
}
