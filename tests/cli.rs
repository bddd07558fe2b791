use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn regwatch_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("regwatch");
    path
}

fn setup_test_env(sources: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/regwatch.sqlite"

[analysis]
provider = "disabled"

{}
"#,
        root.display(),
        sources
    );

    let config_path = config_dir.join("regwatch.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_regwatch(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = regwatch_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run regwatch binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

const FEED_SOURCE: &str = r#"
[[sources]]
id = "ftc-press"
name = "FTC press releases"
url = "https://www.ftc.gov/feeds/press-release.xml"
type = "rss"
jurisdiction_country = "United States"
reliability_tier = 5
"#;

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env("");
    let (stdout, _, success) = run_regwatch(&config, &["init"]);
    assert!(success);
    assert!(stdout.contains("Database initialized successfully."));
    assert!(tmp.path().join("data/regwatch.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env("");
    assert!(run_regwatch(&config, &["init"]).2);
    let (stdout, _, success) = run_regwatch(&config, &["init"]);
    assert!(success);
    assert!(stdout.contains("Database initialized successfully."));
}

#[test]
fn test_sources_lists_registry() {
    let (_tmp, config) = setup_test_env(FEED_SOURCE);
    let (stdout, _, success) = run_regwatch(&config, &["sources"]);
    assert!(success);
    assert!(stdout.contains("ftc-press"));
    assert!(stdout.contains("rss"));
    assert!(stdout.contains("United States"));
}

#[test]
fn test_sources_empty() {
    let (_tmp, config) = setup_test_env("");
    let (stdout, _, success) = run_regwatch(&config, &["sources"]);
    assert!(success);
    assert!(stdout.contains("No sources configured."));
}

#[test]
fn test_cleanup_on_empty_store() {
    let (_tmp, config) = setup_test_env("");
    run_regwatch(&config, &["init"]);
    let (stdout, _, success) = run_regwatch(&config, &["cleanup"]);
    assert!(success);
    assert!(stdout.contains("cleaned: 0"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_sync_laws_on_empty_store() {
    let (_tmp, config) = setup_test_env("");
    run_regwatch(&config, &["init"]);
    let (stdout, _, success) = run_regwatch(&config, &["sync-laws"]);
    assert!(success);
    assert!(stdout.contains("scanned events: 0"));
    assert!(stdout.contains("inserted laws: 0"));
}

#[test]
fn test_backfill_on_empty_store() {
    let (_tmp, config) = setup_test_env("");
    run_regwatch(&config, &["init"]);
    let (stdout, _, success) = run_regwatch(&config, &["backfill"]);
    assert!(success);
    assert!(stdout.contains("scanned: 0"));
}

#[test]
fn test_run_with_no_sources() {
    let (_tmp, config) = setup_test_env("");
    let (stdout, _, success) = run_regwatch(&config, &["run", "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("sources processed: 0"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_run_unknown_source_fails() {
    let (_tmp, config) = setup_test_env(FEED_SOURCE);
    let (_, stderr, success) = run_regwatch(&config, &["run", "--source", "nope"]);
    assert!(!success);
    assert!(stderr.contains("Unknown source id"));
}

#[test]
fn test_run_unknown_progress_mode_fails() {
    let (_tmp, config) = setup_test_env("");
    let (_, stderr, success) = run_regwatch(&config, &["run", "--progress", "loud"]);
    assert!(!success);
    assert!(stderr.contains("Unknown progress mode"));
}

#[test]
fn test_invalid_config_fails() {
    let (_tmp, config) = setup_test_env("[crawl]\nconcurrency = 0\n");
    let (_, stderr, success) = run_regwatch(&config, &["sources"]);
    assert!(!success);
    assert!(stderr.contains("crawl.concurrency"));
}
