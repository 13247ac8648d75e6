// ABOUTME: End-of-run summary rendering for the migrate command
// ABOUTME: Plain stdout block plus structured log lines

use crate::sync::{EntityStatus, RunSummary};

/// Print the run summary to stdout and mirror it to the log.
pub fn print_summary(summary: &RunSummary) {
    tracing::info!(
        "Migration finished in {}ms: {} rows written, {} rows deleted",
        summary.duration_ms,
        summary.total_written(),
        summary.total_deleted()
    );

    println!();
    println!("========================================");
    println!("Migration run complete");
    println!("========================================");
    for report in &summary.entities {
        let status = match &report.status {
            EntityStatus::Done => "done".to_string(),
            EntityStatus::Skipped => "skipped (no changes)".to_string(),
            EntityStatus::Failed(msg) => format!("FAILED: {}", msg),
        };
        println!("  {} -> {} [{}]", report.entity, report.table, status);
        if matches!(report.status, EntityStatus::Done) {
            println!(
                "      {} read, {} written, {} deleted",
                report.records_read, report.rows_written, report.rows_deleted
            );
        }
    }
    println!("  ----------------------------------------");
    println!(
        "  Total: {} written, {} deleted in {}ms",
        summary.total_written(),
        summary.total_deleted(),
        summary.duration_ms
    );
    if !summary.is_success() {
        let failed = summary
            .entities
            .iter()
            .filter(|e| matches!(e.status, EntityStatus::Failed(_)))
            .count();
        println!("  {} entity/entities failed", failed);
    }
}
