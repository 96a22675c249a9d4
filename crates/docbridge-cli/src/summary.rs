//! Human-readable summaries printed after each command.

use colored::Colorize;
use docbridge_core::{CoverageReport, DedupReport, FamilyReport, ReconciliationReport, ResolutionReport};
use docbridge_source::CollectionProfile;

/// Anomalies listed in full up to this many; beyond it only counts.
const MAX_LISTED: usize = 20;

pub fn family(report: &FamilyReport) {
    let c = &report.counters;
    println!(
        "  {} {} seen, {} migrated, {} already present",
        "→".yellow(),
        c.seen,
        c.migrated.to_string().green(),
        c.already_present
    );
    if c.has_failures() {
        println!(
            "  {} {} skipped, {} failed",
            "!".red().bold(),
            c.skipped.to_string().red(),
            c.failed.to_string().red()
        );
    }
    println!(
        "  {} {} child rows, {} child entries skipped",
        "→".yellow(),
        c.child_rows,
        c.children_skipped
    );
    if !report.anomalies.is_empty() {
        println!("  {} {} anomalies:", "→".yellow(), report.anomalies.len());
        for anomaly in report.anomalies.iter().take(MAX_LISTED) {
            println!(
                "      {} {}: {}",
                anomaly.source_id.to_string().dimmed(),
                anomaly.field,
                anomaly.detail
            );
        }
        if report.anomalies.len() > MAX_LISTED {
            println!("      ... {} more", report.anomalies.len() - MAX_LISTED);
        }
    }
    resolution(&report.resolution);
}

pub fn resolution(report: &ResolutionReport) {
    println!(
        "  {} {} references resolved, {} already set",
        "→".yellow(),
        report.resolved,
        report.already_set
    );
    if !report.still_missing.is_empty() {
        println!(
            "  {} {} source ids still unmapped",
            "!".yellow().bold(),
            report.still_missing.len()
        );
    }
}

pub fn verification(report: &ReconciliationReport) {
    println!(
        "{} {}: {} documents, {} rows, {} rows compared",
        "Verified".green().bold(),
        report.family.to_string().bold(),
        report.source_documents,
        report.target_rows,
        report.rows_compared
    );
    if report.is_clean() {
        println!("  {} no discrepancies", "ok".green().bold());
        return;
    }
    println!(
        "  {} {} discrepancies",
        "!".red().bold(),
        report.discrepancies.len().to_string().red()
    );
    for (field, count) in report.summary() {
        println!("      {field}: {count}");
    }
    for d in report.discrepancies.iter().take(MAX_LISTED) {
        println!(
            "      {} {}.{}: expected {}, found {}",
            d.source_identifier.dimmed(),
            d.entity_type,
            d.field,
            d.expected,
            d.actual
        );
    }
}

pub fn dedup(report: &DedupReport) {
    let title = if report.dry_run { "Dry run" } else { "Deduplicated" };
    println!(
        "{} {}: {} groups, {} duplicate rows",
        title.green().bold(),
        report.table.bold(),
        report.groups.len(),
        report.duplicates()
    );
    for group in report.groups.iter().take(MAX_LISTED) {
        println!(
            "      {} {} {}: keep {}, remove {}",
            group.owner,
            group.date,
            group.context,
            group.keep,
            group.remove.len()
        );
    }
    if report.dry_run {
        return;
    }
    for backup in &report.backups {
        println!(
            "  {} {} → {} ({} rows)",
            "backup".yellow(),
            backup.table,
            backup.backup,
            backup.rows
        );
    }
    println!(
        "  {} {} deleted, {} dependent rows deleted, {} aggregates recomputed",
        "ok".green().bold(),
        report.deleted,
        report.cascaded,
        report.recomputed
    );
}

pub fn profile(collection: &str, profile: &CollectionProfile) {
    println!(
        "{} {}: {} documents",
        "Collection".green().bold(),
        collection.bold(),
        profile.documents
    );
    for (path, field) in &profile.fields {
        let types: Vec<&str> = field.types.iter().map(String::as_str).collect();
        println!(
            "  {:<40} {:>6.1}%  {}",
            path,
            profile.coverage(path),
            types.join(" | ").dimmed()
        );
    }
}

pub fn coverage(report: &CoverageReport, top: usize) {
    println!(
        "{} {}: {} documents, {} unique references, {} mapped ({:.1}%)",
        "Coverage".green().bold(),
        report.family.to_string().bold(),
        report.documents,
        report.unique_references,
        report.found,
        report.percentage
    );
    if report.untransformable > 0 {
        println!(
            "  {} {} documents not transformable",
            "!".yellow().bold(),
            report.untransformable
        );
    }
    if report.is_complete() {
        println!("  {} every reference is mapped", "ok".green().bold());
        return;
    }
    println!("  {} most used unmapped ids:", "→".yellow());
    for (id, uses) in report.most_used_missing(top) {
        println!("      {id}  {uses} uses");
    }
}
