//! Credential pool persistence: the live pool file, the quarantine sidecar,
//! and the change watcher that drives hot reload.
//!
//! Files are plain text, one credential per line. `#` starts a comment and
//! a `token=` prefix is accepted. Rewrites are staged in memory and written
//! in a single call so the watcher never observes a torn file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

const EXAMPLE_TEMPLATE: &str = "\
# Credential pool file
# One credential per line. Accepted formats:
#   <credential>
#   token=<credential>
# Lines starting with # are comments.

# Example:
# eyJhbGciOiJFUzI1NiIsInR5cCI6IkpXVCJ9.xxxxx
";

/// Parse the pool file body into credential strings, preserving file order.
pub fn parse_pool_file(content: &str) -> Vec<String> {
    let mut credentials = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let credential = line.strip_prefix("token=").unwrap_or(line);
        if !credential.is_empty() {
            credentials.push(credential.to_string());
        }
    }
    credentials
}

/// Read the live pool file. A missing file is seeded with the example
/// template and treated as empty.
pub fn load_pool_file(path: &Path) -> Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(parse_pool_file(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Err(e) = std::fs::write(path, EXAMPLE_TEMPLATE) {
                warn!("failed to seed example pool file {}: {}", path.display(), e);
            } else {
                info!("created example pool file: {}", path.display());
            }
            Ok(Vec::new())
        }
        Err(e) => Err(e).with_context(|| format!("reading pool file {}", path.display())),
    }
}

/// Rewrite the live pool file with only the surviving credentials.
pub fn write_survivors(path: &Path, survivors: &[String]) -> Result<()> {
    let mut content = String::from("# Credential pool file (automated update)\n");
    content.push_str(&format!(
        "# updated at: {}\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    content.push_str("# invalidated credentials moved to tokens_invalid.txt\n\n");
    content.push_str(&survivors.join("\n"));
    if !survivors.is_empty() {
        content.push('\n');
    }
    std::fs::write(path, content)
        .with_context(|| format!("rewriting pool file {}", path.display()))
}

/// Append quarantined credentials to the sidecar file, each under a
/// timestamp comment.
pub fn append_quarantined(path: &Path, dead: &[String]) -> Result<()> {
    use std::io::Write;

    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening quarantine file {}", path.display()))?;
    for credential in dead {
        writeln!(file, "# invalidated at {}\n{}", timestamp, credential)?;
    }
    Ok(())
}

/// Watch the data directory for edits to the pool file. Each Create/Modify
/// event schedules a reload after a short settle delay, so partially written
/// files are not parsed mid-edit. Returns the watcher handle; dropping it
/// stops the watch.
pub fn spawn_watcher<F>(data_dir: PathBuf, on_change: F) -> Result<notify::RecommendedWatcher>
where
    F: Fn() + Send + Sync + 'static,
{
    use notify::{RecursiveMode, Watcher};

    let handle = tokio::runtime::Handle::current();
    let on_change = std::sync::Arc::new(on_change);

    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                ) && event
                    .paths
                    .iter()
                    .any(|p| p.file_name().is_some_and(|n| n == "tokens.txt"));
                if relevant {
                    info!("pool file changed, scheduling reload");
                    let on_change = on_change.clone();
                    handle.spawn(async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        on_change();
                    });
                }
            }
            Err(e) => error!("pool file watcher error: {}", e),
        })?;

    watcher.watch(&data_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parse_skips_comments_and_blanks() {
        let content = "# header\n\ncred-a\n  token=cred-b  \n# trailing\ncred-c\n";
        assert_eq!(parse_pool_file(content), vec!["cred-a", "cred-b", "cred-c"]);
    }

    #[test]
    fn parse_empty_token_prefix_is_dropped() {
        assert_eq!(parse_pool_file("token=\ncred"), vec!["cred"]);
    }

    #[test]
    fn missing_file_is_seeded_and_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.txt");
        let creds = load_pool_file(&path).unwrap();
        assert!(creds.is_empty());
        let seeded = std::fs::read_to_string(&path).unwrap();
        assert!(seeded.starts_with("# Credential pool file"));
        // The template itself parses to an empty pool.
        assert!(parse_pool_file(&seeded).is_empty());
    }

    #[test]
    fn survivors_roundtrip_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.txt");
        let survivors = vec!["c1".to_string(), "c2".to_string(), "c3".to_string()];
        write_survivors(&path, &survivors).unwrap();
        assert_eq!(load_pool_file(&path).unwrap(), survivors);
    }

    #[test]
    fn quarantine_appends_with_timestamp_comment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens_invalid.txt");
        append_quarantined(&path, &["dead-1".to_string()]).unwrap();
        append_quarantined(&path, &["dead-2".to_string()]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# invalidated at "));
        assert!(content.contains("dead-1"));
        assert!(content.contains("dead-2"));
    }
}
