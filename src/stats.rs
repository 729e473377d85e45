//! Index and job overview for `docqa stats`.
//!
//! Reads the persisted files directly, so it works without loading an
//! embedding model or reaching the generation backend.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::index::IndexStore;
use crate::jobs::JobTracker;
use crate::models::JobStatus;

/// Print a summary of the data directory.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = IndexStore::new(&config.data);
    let index = store
        .stats()
        .await
        .context("Failed to read index files")?;
    let jobs = JobTracker::new(config.data.jobs_path())
        .list()
        .context("Failed to read job map")?;

    let index_size = file_size(&config.data.index_path()) + file_size(&config.data.metadata_path());

    println!("docqa: Index Stats");
    println!("==================");
    println!();
    println!("  Data dir:    {}", config.data.dir.display());
    println!("  Size:        {}", format_bytes(index_size));
    println!();
    println!("  Documents:   {}", index.documents);
    println!("  Passages:    {}", index.passages);
    println!(
        "  Dimensions:  {}",
        index
            .dims
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("  Generation:  {}", index.generation);

    if !jobs.is_empty() {
        let count = |s: JobStatus| jobs.iter().filter(|j| j.status == s).count();
        println!();
        println!("  Jobs:");
        println!(
            "  {:>8} {:>12} {:>11} {:>8}",
            "QUEUED", "PROCESSING", "COMPLETED", "FAILED"
        );
        println!(
            "  {:>8} {:>12} {:>11} {:>8}",
            count(JobStatus::Queued),
            count(JobStatus::Processing),
            count(JobStatus::Completed),
            count(JobStatus::Failed)
        );
        if let Some(last) = jobs.iter().map(|j| j.updated_at).max() {
            println!("  Last activity: {}", format_ts_relative(last.timestamp()));
        }
    }

    println!();
    Ok(())
}

fn file_size(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
