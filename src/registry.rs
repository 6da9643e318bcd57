//! Display-name → upstream-model mapping: a built-in table seeded at
//! startup, enriched by a periodic catalog fetch, with synthetic
//! `-thinking` / `-search` suffix variants exposed in the listing.

use crate::config::AppConfig;
use crate::models::ModelInfo;
use crate::upstream::{UpstreamClient, UpstreamModel};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const FETCH_INTERVAL: Duration = Duration::from_secs(300);
const SUFFIXES: [&str; 3] = ["-thinking", "-search", "-thinking-search"];

#[derive(Debug, Clone)]
pub struct ModelMapping {
    pub display_name: String,
    pub upstream_model_id: String,
    pub upstream_model_name: String,
    pub enable_thinking: bool,
    pub web_search: bool,
    pub auto_web_search: bool,
    pub mcp_servers: Vec<String>,
    pub owned_by: String,
    pub is_builtin: bool,
}

pub struct ModelRegistry {
    mappings: RwLock<HashMap<String, ModelMapping>>,
    created: u64,
}

/// Split a requested model name into its base name and requested
/// thinking/search flags.
pub fn parse_model_name(model: &str) -> (String, bool, bool) {
    let lower = model.to_lowercase();
    if let Some(base) = lower.strip_suffix("-thinking-search") {
        return (model[..base.len()].to_string(), true, true);
    }
    if let Some(base) = lower.strip_suffix("-thinking") {
        return (model[..base.len()].to_string(), true, false);
    }
    if let Some(base) = lower.strip_suffix("-search") {
        return (model[..base.len()].to_string(), false, true);
    }
    (model.to_string(), false, false)
}

fn has_variant_suffix(model: &str) -> bool {
    let lower = model.to_lowercase();
    SUFFIXES.iter().any(|s| lower.ends_with(s))
}

impl ModelRegistry {
    pub fn new(cfg: &AppConfig) -> Self {
        let registry = Self {
            mappings: RwLock::new(HashMap::new()),
            created: chrono::Utc::now().timestamp() as u64,
        };
        registry.seed_builtins(cfg);
        registry
    }

    fn seed_builtins(&self, cfg: &AppConfig) {
        let advanced = vec!["advanced-search".to_string()];
        let search_mcp = vec![
            "advanced-search".to_string(),
            "deep-web-search".to_string(),
        ];
        let vision_mcp = vec![
            "advanced-search".to_string(),
            "vlm-image-search".to_string(),
            "vlm-image-recognition".to_string(),
            "vlm-image-processing".to_string(),
        ];

        let builtin = |display: &str,
                       upstream_id: &str,
                       upstream_name: &str,
                       web_search: bool,
                       auto_web_search: bool,
                       enable_thinking: bool,
                       mcp: &[String]| ModelMapping {
            display_name: display.to_string(),
            upstream_model_id: upstream_id.to_string(),
            upstream_model_name: upstream_name.to_string(),
            enable_thinking,
            web_search,
            auto_web_search,
            mcp_servers: mcp.to_vec(),
            owned_by: "z.ai".to_string(),
            is_builtin: true,
        };

        let entries = vec![
            builtin(&cfg.primary_model, "0727-360B-API", "GLM-4.5", false, true, true, &advanced),
            builtin(&cfg.thinking_model, "0727-360B-API", "GLM-4.5-Thinking", false, true, true, &advanced),
            builtin(&cfg.search_model, "0727-360B-API", "GLM-4.5-Search", true, true, true, &search_mcp),
            builtin(&cfg.air_model, "0727-106B-API", "GLM-4.5-Air", false, true, true, &advanced),
            builtin(&cfg.primary_model_new, "GLM-4-6-API-V1", "GLM-4.6", false, true, true, &advanced),
            builtin(&cfg.thinking_model_new, "GLM-4-6-API-V1", "GLM-4.6-Thinking", false, true, true, &advanced),
            builtin(&cfg.search_model_new, "GLM-4-6-API-V1", "GLM-4.6-Search", true, true, true, &search_mcp),
            builtin("GLM-4.7", "glm-4.7", "GLM-4.7", false, true, true, &advanced),
            builtin("GLM-4.7-Thinking", "glm-4.7", "GLM-4.7-Thinking", false, true, true, &advanced),
            builtin("GLM-4.7-Search", "glm-4.7", "GLM-4.7-Search", true, true, true, &search_mcp),
            builtin("GLM-4.5-V", "glm-4.5v", "GLM-4.5-V", false, true, true, &advanced),
            builtin("GLM-4.6-V", "glm-4.6v", "GLM-4.6-V", false, true, true, &vision_mcp),
            builtin("GLM-5", "glm-5", "GLM-5", false, false, false, &[]),
            builtin("GLM-5-Thinking", "glm-5", "GLM-5-Thinking", false, false, true, &[]),
            builtin("GLM-5-Search", "glm-5", "GLM-5-Search", true, true, true, &search_mcp),
        ];

        let mut mappings = self.mappings.write().unwrap_or_else(|e| e.into_inner());
        for entry in entries {
            mappings.insert(entry.display_name.clone(), entry);
        }
    }

    /// Resolve a requested model name to its upstream mapping. Suffix flags
    /// OR into the base mapping's defaults; an exact-name match wins when no
    /// base mapping exists.
    pub fn resolve(&self, model: &str) -> Option<ModelMapping> {
        let (base, want_thinking, want_search) = parse_model_name(model);
        let mappings = self.mappings.read().unwrap_or_else(|e| e.into_inner());

        let base_mapping = mappings
            .get(&base)
            .or_else(|| mappings.values().find(|m| m.display_name.eq_ignore_ascii_case(&base)));
        if let Some(mapping) = base_mapping {
            let mut mapping = mapping.clone();
            if want_thinking {
                mapping.enable_thinking = true;
            }
            if want_search {
                mapping.web_search = true;
                mapping.auto_web_search = true;
            }
            return Some(mapping);
        }

        mappings
            .get(model)
            .or_else(|| mappings.values().find(|m| m.display_name.eq_ignore_ascii_case(model)))
            .cloned()
    }

    /// Register catalog entries fetched from the upstream. Only `glm*` ids
    /// not already present (case-insensitive) are added; built-ins are never
    /// overwritten and nothing is ever deleted.
    pub fn register_fetched(&self, models: &[UpstreamModel]) -> usize {
        let mut mappings = self.mappings.write().unwrap_or_else(|e| e.into_inner());
        let mut added = 0;

        for model in models {
            if !model.id.to_lowercase().starts_with("glm") {
                continue;
            }
            let exists = mappings
                .keys()
                .any(|k| k.eq_ignore_ascii_case(&model.id));
            if exists {
                continue;
            }

            let display_name = if model.name.is_empty() {
                model.id.clone()
            } else {
                model.name.clone()
            };
            let owned_by = match model.owned_by.as_str() {
                "" | "openai" => "z.ai".to_string(),
                other => other.to_string(),
            };

            let mut mcp_servers = vec!["advanced-search".to_string()];
            if model.id.to_lowercase().contains("-v") {
                mcp_servers.extend([
                    "vlm-image-search".to_string(),
                    "vlm-image-recognition".to_string(),
                    "vlm-image-processing".to_string(),
                ]);
            }

            mappings.insert(
                model.id.clone(),
                ModelMapping {
                    display_name,
                    upstream_model_id: model.id.clone(),
                    upstream_model_name: model.name.clone(),
                    enable_thinking: true,
                    web_search: false,
                    auto_web_search: true,
                    mcp_servers,
                    owned_by,
                    is_builtin: false,
                },
            );
            added += 1;
        }

        if added > 0 {
            info!("registered {} new dynamic models", added);
        }
        added
    }

    /// All exposed model ids: every mapping plus suffix variants for ids
    /// without one, case-insensitively de-duplicated.
    pub fn list(&self) -> Vec<ModelInfo> {
        let mappings = self.mappings.read().unwrap_or_else(|e| e.into_inner());
        let mut seen = std::collections::HashSet::new();
        let mut models = Vec::new();

        let mut push = |id: &str, owned_by: &str, models: &mut Vec<ModelInfo>| {
            if seen.insert(id.to_lowercase()) {
                models.push(ModelInfo {
                    id: id.to_string(),
                    object: "model".to_string(),
                    created: self.created,
                    owned_by: owned_by.to_string(),
                });
            }
        };

        let mut ids: Vec<&String> = mappings.keys().collect();
        ids.sort();
        for id in ids {
            let mapping = &mappings[id];
            push(id, &mapping.owned_by, &mut models);
            if !has_variant_suffix(id) {
                for suffix in SUFFIXES {
                    push(&format!("{}{}", id, suffix), &mapping.owned_by, &mut models);
                }
            }
        }

        models
    }

    /// Periodic catalog refresh: grab an anonymous credential and pull
    /// /api/models every few minutes.
    pub fn spawn_fetcher(
        self: &Arc<Self>,
        upstream: Arc<UpstreamClient>,
        cancel: CancellationToken,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                registry.fetch_once(&upstream).await;
                tokio::select! {
                    _ = tokio::time::sleep(FETCH_INTERVAL) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    async fn fetch_once(&self, upstream: &UpstreamClient) {
        let token = match upstream.fetch_anonymous_token().await {
            Ok(token) => token,
            Err(e) => {
                debug!("anonymous credential for model fetch unavailable: {}", e);
                return;
            }
        };
        match upstream.fetch_models(&token).await {
            Ok(models) => {
                info!("fetched {} models from upstream catalog", models.len());
                self.register_fetched(&models);
            }
            Err(e) => debug!("model catalog fetch failed: {}", e),
        }
    }
}
