use std::path::PathBuf;

/// Runtime configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Directory holding tokens.txt / tokens_invalid.txt.
    pub data_dir: PathBuf,
    /// Base URL of the upstream chat service.
    pub upstream_base: String,

    pub primary_model: String,
    pub thinking_model: String,
    pub search_model: String,
    pub air_model: String,
    pub primary_model_new: String,
    pub thinking_model_new: String,
    pub search_model_new: String,

    /// Emulate OpenAI function calling by prompt injection.
    pub tool_support: bool,
    /// Surface upstream thinking deltas as reasoning_content.
    pub show_thinking: bool,
    /// Max bytes of answer text scanned for tool invocations.
    pub scan_limit: usize,
    pub debug_logging: bool,
    /// Free-form operator note shown on the root endpoint.
    pub note: String,
}

pub const DEFAULT_UPSTREAM_BASE: &str = "https://chat.z.ai";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: PathBuf::from("data"),
            upstream_base: DEFAULT_UPSTREAM_BASE.to_string(),
            primary_model: "GLM-4.5".to_string(),
            thinking_model: "GLM-4.5-Thinking".to_string(),
            search_model: "GLM-4.5-Search".to_string(),
            air_model: "GLM-4.5-Air".to_string(),
            primary_model_new: "GLM-4.6".to_string(),
            thinking_model_new: "GLM-4.6-Thinking".to_string(),
            search_model_new: "GLM-4.6-Search".to_string(),
            tool_support: true,
            show_thinking: true,
            scan_limit: 200_000,
            debug_logging: false,
            note: String::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            port: env_parse("PORT", d.port),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            upstream_base: env_string("UPSTREAM_BASE", &d.upstream_base),
            primary_model: env_string("PRIMARY_MODEL", &d.primary_model),
            thinking_model: env_string("THINKING_MODEL", &d.thinking_model),
            search_model: env_string("SEARCH_MODEL", &d.search_model),
            air_model: env_string("AIR_MODEL", &d.air_model),
            primary_model_new: env_string("PRIMARY_MODEL_NEW", &d.primary_model_new),
            thinking_model_new: env_string("THINKING_MODEL_NEW", &d.thinking_model_new),
            search_model_new: env_string("SEARCH_MODEL_NEW", &d.search_model_new),
            tool_support: env_bool("TOOL_SUPPORT", d.tool_support),
            show_thinking: env_bool("SHOW_THINKING", d.show_thinking),
            scan_limit: env_parse("SCAN_LIMIT", d.scan_limit),
            debug_logging: env_bool("DEBUG_LOGGING", d.debug_logging),
            note: env_string("NOTE", ""),
        }
    }

    /// Effective tracing filter directive: LOG_LEVEL wins, then the debug
    /// flag, then info.
    pub fn log_filter(&self) -> String {
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            if !level.is_empty() {
                return level;
            }
        }
        if self.debug_logging {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    }

    pub fn token_file(&self) -> PathBuf {
        self.data_dir.join("tokens.txt")
    }

    pub fn quarantine_file(&self) -> PathBuf {
        self.data_dir.join("tokens_invalid.txt")
    }
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_model_family() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.primary_model, "GLM-4.5");
        assert_eq!(cfg.primary_model_new, "GLM-4.6");
        assert_eq!(cfg.scan_limit, 200_000);
        assert!(cfg.tool_support);
    }

    #[test]
    fn token_paths_follow_data_dir() {
        let cfg = AppConfig {
            data_dir: PathBuf::from("/tmp/zgate"),
            ..Default::default()
        };
        assert_eq!(cfg.token_file(), PathBuf::from("/tmp/zgate/tokens.txt"));
        assert_eq!(
            cfg.quarantine_file(),
            PathBuf::from("/tmp/zgate/tokens_invalid.txt")
        );
    }
}
