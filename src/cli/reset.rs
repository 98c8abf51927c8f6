//! CLI `reset` command — delete all fragments after user confirmation.

use anyhow::{bail, Result};
use std::io::Write;

use crate::config::MnemonConfig;

/// Delete all stored data after user confirmation.
pub fn reset(config: &MnemonConfig, skip_confirmation: bool) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !skip_confirmation {
        println!("WARNING: This will permanently delete ALL fragments, links, versions, and feedback.");
        println!("Database: {}", db_path.display());
        print!("\nType YES to confirm: ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if input.trim() != "YES" {
            bail!("reset cancelled");
        }
    }

    let conn = crate::db::open_database(&db_path)?;

    // Drop all data — order matters for FK constraints
    conn.execute_batch(
        "DELETE FROM fragment_links;
         DELETE FROM fragment_versions;
         DELETE FROM tool_feedback;
         DELETE FROM task_feedback;
         DELETE FROM fragments_fts;
         DELETE FROM fragments_vec;
         DELETE FROM fragments;",
    )?;

    println!("All fragments deleted. Database reset complete.");
    Ok(())
}
