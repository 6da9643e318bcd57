//! Frontend asset version oracle.
//!
//! The upstream rejects requests whose X-FE-Version header drifts too far
//! from the deployed frontend, so the current value is scraped from the
//! landing page HTML and refreshed hourly.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

pub struct FeVersion {
    current: RwLock<String>,
    pattern: regex::Regex,
}

impl Default for FeVersion {
    fn default() -> Self {
        Self::new()
    }
}

impl FeVersion {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(String::new()),
            pattern: regex::Regex::new(r"prod-fe-[\.\d]+").expect("version regex"),
        }
    }

    pub fn get(&self) -> String {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Extract and store the version string from landing-page HTML.
    /// Returns the new value when one was found.
    pub fn update_from_html(&self, html: &str) -> Option<String> {
        let found = self.pattern.find(html)?.as_str().to_string();
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = found.clone();
        Some(found)
    }

    async fn fetch(&self, client: &reqwest::Client, base_url: &str) {
        let page = async {
            client
                .get(format!("{}/", base_url))
                .send()
                .await?
                .text()
                .await
        }
        .await;
        match page {
            Ok(html) => {
                if let Some(version) = self.update_from_html(&html) {
                    info!("updated frontend version: {}", version);
                }
            }
            Err(e) => error!("failed to fetch frontend version: {}", e),
        }
    }

    pub fn spawn_refresher(
        self: &Arc<Self>,
        client: reqwest::Client,
        base_url: String,
        cancel: CancellationToken,
    ) {
        let oracle = self.clone();
        tokio::spawn(async move {
            loop {
                oracle.fetch(&client, &base_url).await;
                tokio::select! {
                    _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_version_from_html() {
        let oracle = FeVersion::new();
        let html = r#"<script src="/assets/prod-fe-1.0.76/main.js"></script>"#;
        assert_eq!(oracle.update_from_html(html).as_deref(), Some("prod-fe-1.0.76"));
        assert_eq!(oracle.get(), "prod-fe-1.0.76");
    }

    #[test]
    fn keeps_previous_value_when_absent() {
        let oracle = FeVersion::new();
        oracle.update_from_html("prod-fe-2.1");
        assert!(oracle.update_from_html("<html>nothing here</html>").is_none());
        assert_eq!(oracle.get(), "prod-fe-2.1");
    }
}
