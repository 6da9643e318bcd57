//! Credential pool invariants: rotation fairness and quarantine behavior.

use std::collections::HashMap;
use tempfile::TempDir;
use zgate::auth::CredentialPool;

fn pool_with(creds: &[&str]) -> (CredentialPool, TempDir) {
    let dir = TempDir::new().unwrap();
    let token_file = dir.path().join("tokens.txt");
    std::fs::write(&token_file, creds.join("\n")).unwrap();
    let pool = CredentialPool::new(token_file, dir.path().join("tokens_invalid.txt"));
    pool.reload().unwrap();
    (pool, dir)
}

#[test]
fn rotation_is_fair_over_many_acquisitions() {
    let (pool, _dir) = pool_with(&["cred-1", "cred-2", "cred-3"]);

    let m = 100;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..m {
        *counts.entry(pool.acquire().unwrap()).or_default() += 1;
    }

    // each credential is returned floor(M/N) or ceil(M/N) times
    let min = counts.values().min().unwrap();
    let max = counts.values().max().unwrap();
    assert!(max - min <= 1, "unfair rotation: {:?}", counts);
    assert_eq!(counts.values().sum::<usize>(), m);
}

#[test]
fn quarantine_survivors_reload_in_file_order() {
    let (pool, dir) = pool_with(&["alpha", "beta", "gamma", "delta"]);
    pool.mark_invalid("beta");
    pool.mark_invalid("delta");
    pool.quarantine_invalid();

    // quarantine file holds both dead credentials under timestamp comments
    let dead = std::fs::read_to_string(dir.path().join("tokens_invalid.txt")).unwrap();
    assert!(dead.contains("beta"));
    assert!(dead.contains("delta"));
    assert!(dead.contains("# invalidated at "));

    // a fresh pool reading the rewritten file sees exactly the survivors
    let fresh = CredentialPool::new(
        dir.path().join("tokens.txt"),
        dir.path().join("tokens_invalid.txt"),
    );
    fresh.reload().unwrap();
    let order: Vec<String> = (0..2).map(|_| fresh.acquire().unwrap()).collect();
    assert_eq!(order, vec!["alpha", "gamma"]);
}

#[test]
fn quarantine_is_idempotent() {
    let (pool, dir) = pool_with(&["one", "two"]);
    pool.mark_invalid("two");
    pool.quarantine_invalid();
    // a second pass with nothing invalid leaves the files untouched
    let before = std::fs::read_to_string(dir.path().join("tokens.txt")).unwrap();
    pool.quarantine_invalid();
    let after = std::fs::read_to_string(dir.path().join("tokens.txt")).unwrap();
    assert_eq!(before, after);
}

#[test]
fn token_prefix_lines_parse() {
    let (pool, _dir) = pool_with(&["token=wrapped-cred", "# comment", "", "bare-cred"]);
    let stats = pool.stats();
    assert_eq!(stats.valid_credentials, 2);
    assert_eq!(pool.acquire().unwrap(), "wrapped-cred");
    assert_eq!(pool.acquire().unwrap(), "bare-cred");
}

#[test]
fn reload_picks_up_new_lines_and_keeps_counts() {
    let (pool, dir) = pool_with(&["first"]);
    pool.acquire();
    pool.acquire();

    let token_file = dir.path().join("tokens.txt");
    std::fs::write(&token_file, "first\nsecond\n").unwrap();
    pool.reload().unwrap();

    assert_eq!(pool.stats().valid_credentials, 2);
    // first still leads the ring and kept its use count; after two more
    // acquisitions the counts even out at 3 vs 1
    assert_eq!(pool.acquire().unwrap(), "first");
    assert_eq!(pool.acquire().unwrap(), "second");
}
