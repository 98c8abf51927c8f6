//! CLI `consolidate` command — run the pipeline once and print the report.

use anyhow::Result;

use crate::config::MnemonConfig;
use crate::llm::LlmClient;
use crate::memory::consolidate::Consolidator;
use crate::memory::index::KeywordIndex;
use crate::nli::NliClassifier;

/// Run the consolidation pipeline against the configured database.
///
/// The CLI process has its own (empty) keyword index, so the index-pruning
/// stage is a no-op here; everything durable runs in full.
pub fn consolidate(config: &MnemonConfig) -> Result<()> {
    let db_path = config.resolved_db_path();
    let mut conn = crate::db::open_database(&db_path)?;

    let embedder = crate::embedding::create_provider(&config.embedding)?;
    let nli = NliClassifier::from_config(&config.nli)?;
    let llm = LlmClient::from_config(&config.llm)?;
    let index = KeywordIndex::new(
        config.working_memory.max_tokens,
        config.working_memory.eviction_importance,
    );

    let consolidator = Consolidator::new(
        config.consolidation.clone(),
        config.resolved_report_dir(),
    );

    println!("Running consolidation pipeline...");
    let report = consolidator.run(&mut conn, &index, embedder.as_ref(), &nli, &llm);

    println!();
    println!("  Tier transitions:       {}", report.tier_transitions);
    println!("  Importance decayed:     {}", report.decayed);
    println!("  Expired deleted:        {}", report.expired);
    println!("  Duplicates merged:      {}", report.duplicates_merged);
    println!("  Embeddings backfilled:  {}", report.embeddings_backfilled);
    println!("  Utility recomputed:     {}", report.utility_recomputed);
    println!("  Anchors promoted:       {}", report.anchors_promoted);
    println!("  Contradictions found:   {}", report.contradictions_found);
    println!("  Contradictions queued:  {}", report.contradictions_queued);
    println!("  Pending resolved:       {}", report.pending_resolved);
    if let Some(ref path) = report.feedback_report {
        println!("  Feedback report:        {path}");
    }
    if !report.stale_fragments.is_empty() {
        println!("\n  Oldest-verified fragments:");
        for entry in report.stale_fragments.iter().take(10) {
            println!(
                "    {:<22} {:<10} {:>5} days  ({})",
                entry.id, entry.fragment_type, entry.days_since_verified, entry.topic
            );
        }
    }
    if !report.stage_errors.is_empty() {
        println!("\n  Stage errors:");
        for error in &report.stage_errors {
            println!("    {error}");
        }
    }
    println!("\nConsolidation complete.");
    Ok(())
}
