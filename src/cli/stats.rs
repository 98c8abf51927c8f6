//! CLI `stats` command — print memory store statistics.

use anyhow::Result;

use crate::config::MnemonConfig;
use crate::memory::stats::memory_stats;

/// Print store statistics as formatted text.
pub fn stats(config: &MnemonConfig) -> Result<()> {
    let db_path = config.resolved_db_path();
    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `mnemon serve` to initialize.");
        return Ok(());
    }

    let conn = crate::db::open_database(&db_path)?;
    let stats = memory_stats(&conn, Some(&db_path))?;

    println!("mnemon memory statistics");
    println!("========================");
    println!();
    println!("Fragments:        {}", stats.total_fragments);
    println!("  with embedding: {}", stats.with_embedding);
    println!("  anchors:        {}", stats.anchors);
    println!("Links:            {}", stats.links);
    println!("Versions:         {}", stats.versions);
    println!("Avg importance:   {:.3}", stats.avg_importance);
    println!();
    println!("By type:");
    for (fragment_type, count) in sorted(&stats.by_type) {
        println!("  {fragment_type:<12} {count}");
    }
    println!("By tier:");
    for (tier, count) in sorted(&stats.by_tier) {
        println!("  {tier:<12} {count}");
    }
    println!("By agent:");
    for (agent, count) in sorted(&stats.by_agent) {
        println!("  {agent:<12} {count}");
    }
    println!();
    println!("Feedback:         {} tool, {} task", stats.tool_feedback_entries, stats.task_feedback_entries);
    if let (Some(oldest), Some(newest)) = (&stats.oldest_fragment, &stats.newest_fragment) {
        println!("Oldest fragment:  {oldest}");
        println!("Newest fragment:  {newest}");
    }
    println!("DB size:          {}", format_bytes(stats.db_size_bytes));
    Ok(())
}

fn sorted(map: &std::collections::HashMap<String, u64>) -> Vec<(&String, &u64)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    entries
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
