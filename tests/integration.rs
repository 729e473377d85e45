use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docqa_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_docqa"))
}

/// Temp dir with an offline config (hash embedder, no generation, no OCR)
/// and a few documents to ingest.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.txt"),
        "The alpha document is about Rust programming.\n\nIt covers cargo, crates and the borrow checker.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.txt"),
        "The beta document discusses gardening.\n\nTomatoes need compost, sunlight and water.",
    )
    .unwrap();
    fs::write(files_dir.join("notes.md"), "markdown is not accepted").unwrap();

    let config_content = format!(
        r#"[data]
dir = "{}/data"

[chunking]
size = 200
overlap = 40

[embedding]
provider = "hash"
dims = 512

[generation]
provider = "disabled"

[ocr]
enabled = false
"#,
        root.display()
    );
    let config_path = root.join("docqa.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docqa(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docqa_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docqa binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn file(config_path: &Path, name: &str) -> String {
    config_path
        .parent()
        .unwrap()
        .join("files")
        .join(name)
        .display()
        .to_string()
}

#[test]
fn test_ingest_reports_passages() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docqa(
        &config_path,
        &["ingest", &file(&config_path, "alpha.txt"), "--doc-id", "alpha"],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Ingested alpha.txt"));
    assert!(stdout.contains("doc_id:   alpha"));
    assert!(stdout.contains("passages: 1"));

    let data = config_path.parent().unwrap().join("data");
    assert!(data.join("index.bin").exists());
    assert!(data.join("metadata.json").exists());
    assert!(data.join("manifest.json").exists());
    assert!(data.join("metrics.jsonl").exists());
}

#[test]
fn test_ingest_rejects_unsupported_file() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) =
        run_docqa(&config_path, &["ingest", &file(&config_path, "notes.md")]);
    assert!(!success);
    assert!(stderr.contains("unsupported file format"));
}

#[test]
fn test_ask_returns_excerpts_without_backend() {
    let (_tmp, config_path) = setup_test_env();
    run_docqa(
        &config_path,
        &["ingest", &file(&config_path, "alpha.txt"), "--doc-id", "alpha"],
    );
    run_docqa(
        &config_path,
        &["ingest", &file(&config_path, "beta.txt"), "--doc-id", "beta"],
    );

    let (stdout, stderr, success) = run_docqa(
        &config_path,
        &["ask", "tomatoes compost sunlight", "--top-k", "1"],
    );
    assert!(success, "ask failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Generation backend not configured"));
    assert!(stdout.contains("[Source: beta.txt]"));
    assert!(stdout.contains("1. ["));
    assert!(!stdout.contains("alpha.txt"));
}

#[test]
fn test_ask_on_empty_index() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_docqa(&config_path, &["ask", "is anything indexed?"]);
    assert!(success);
    assert!(stdout.contains("No relevant context found in the indexed documents."));
}

#[test]
fn test_ask_validates_question_length() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_docqa(&config_path, &["ask", "hi"]);
    assert!(!success);
    assert!(stderr.contains("question must be between 3 and 500 characters"));
}

#[test]
fn test_stats_counts_documents() {
    let (_tmp, config_path) = setup_test_env();
    run_docqa(&config_path, &["ingest", &file(&config_path, "alpha.txt")]);
    run_docqa(&config_path, &["ingest", &file(&config_path, "beta.txt")]);

    let (stdout, stderr, success) = run_docqa(&config_path, &["stats"]);
    assert!(success, "stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Documents:   2"));
    assert!(stdout.contains("Passages:    2"));
    assert!(stdout.contains("Dimensions:  512"));
}

#[test]
fn test_status_of_unknown_job() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_docqa(&config_path, &["status", "does-not-exist"]);
    assert!(!success);
    assert!(stderr.contains("job not found"));
}

#[test]
fn test_jobs_empty() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_docqa(&config_path, &["jobs"]);
    assert!(success);
    assert!(stdout.contains("No jobs."));
}

#[test]
fn test_invalid_config_is_reported() {
    let (_tmp, config_path) = setup_test_env();
    fs::write(&config_path, "[chunking]\nsize = 10\noverlap = 10\n").unwrap();
    let (_, stderr, success) = run_docqa(&config_path, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("chunking.overlap"));
}
