use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};

use strata_core::{
    FileOutcome, MigrateReport, MigrationState, ResetReport, RollbackReport, StatusReport,
    VerifyReport,
};

/// Print the catalog merged with the state store as a colored table.
pub fn print_status(report: &StatusReport) {
    if report.entries.is_empty() {
        println!("{}", "No migrations found.".yellow());
    } else {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Filename"),
                Cell::new("Group"),
                Cell::new("State"),
                Cell::new("Applied At"),
                Cell::new("Checksum"),
            ]);

        for entry in &report.entries {
            let applied_at = entry
                .applied_at
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();

            table.add_row(vec![
                Cell::new(&entry.filename),
                Cell::new(&entry.group),
                Cell::new(format_state(entry.state)),
                Cell::new(&applied_at),
                Cell::new(entry.checksum.as_deref().unwrap_or("")),
            ]);
        }

        println!("{table}");
        println!(
            "{} applied, {} pending",
            report.applied.to_string().green(),
            report.pending.to_string().yellow()
        );
    }

    println!();
    print_verify_summary(&report.verify);
}

fn format_state(state: MigrationState) -> String {
    match state {
        MigrationState::Pending => "Pending".yellow().to_string(),
        MigrationState::Applied => "Applied".green().to_string(),
        MigrationState::Drifted => "Drifted".cyan().to_string(),
        MigrationState::Missing => "Missing".red().to_string(),
        MigrationState::Orphaned => "Orphaned".dimmed().to_string(),
    }
}

/// Print a migration report summary.
pub fn print_migrate_summary(report: &MigrateReport) {
    for detail in &report.details {
        match &detail.outcome {
            FileOutcome::Applied {
                statements,
                execution_time_ms,
            } => println!(
                "  {} {} [{}] ({} statement(s), {}ms)",
                "→".green(),
                detail.filename,
                detail.group,
                statements,
                execution_time_ms
            ),
            FileOutcome::Skipped => println!(
                "  {}",
                format!("· {} already applied", detail.filename).dimmed()
            ),
            FileOutcome::Drifted { recorded, current } => println!(
                "  {} {} changed since it was applied (recorded {}, now {})",
                "!".yellow().bold(),
                detail.filename,
                recorded,
                current
            ),
            FileOutcome::SkippedMissing { available } => {
                println!(
                    "  {} {} not found, skipped",
                    "?".yellow().bold(),
                    detail.filename
                );
                if !available.is_empty() {
                    println!(
                        "    {}",
                        format!("available: {}", available.join(", ")).dimmed()
                    );
                }
            }
            FileOutcome::Pending { statements } => println!(
                "  {} {} [{}] ({} statement(s))",
                "→".cyan(),
                detail.filename,
                detail.group,
                statements
            ),
        }
    }

    if report.dry_run {
        if report.pending == 0 {
            println!("{}", "Dry run: schema is up to date.".green());
        } else {
            println!(
                "{}",
                format!("Dry run: {} migration(s) would be applied.", report.pending).cyan()
            );
        }
        return;
    }

    if report.applied == 0 {
        println!("{}", "Schema is up to date. No migrations to apply.".green());
    } else {
        println!(
            "{}",
            format!(
                "Successfully applied {} migration(s) ({}ms)",
                report.applied, report.total_time_ms
            )
            .green()
            .bold()
        );
    }

    let mut notes = Vec::new();
    if report.skipped > 0 {
        notes.push(format!("{} skipped", report.skipped));
    }
    if report.drifted > 0 {
        notes.push(format!("{} drifted", report.drifted));
    }
    if report.missing > 0 {
        notes.push(format!("{} missing", report.missing));
    }
    if !notes.is_empty() {
        println!("{}", notes.join(", ").dimmed());
    }

    if let Some(verify) = &report.verify {
        println!();
        print_verify_summary(verify);
    }
}

/// Print extensions, tables and feature checks found in the current schema.
pub fn print_verify_summary(report: &VerifyReport) {
    println!("{}", "Extensions".bold());
    if report.extensions.is_empty() {
        println!("  {}", "none".dimmed());
    }
    for ext in &report.extensions {
        let mark = if ext.present { "✓".green() } else { "✗".red() };
        println!("  {} {}", mark, ext.name);
    }

    println!("{} ({})", "Tables".bold(), report.tables.len());
    if !report.tables.is_empty() {
        println!("  {}", report.tables.join(", "));
    }

    if !report.features.is_empty() {
        println!("{}", "Features".bold());
        for feature in &report.features {
            if feature.ok {
                println!("  {} {}", "✓".green(), feature.name);
            } else {
                println!(
                    "  {} {} {}",
                    "✗".red(),
                    feature.name,
                    format!("({})", feature.detail).dimmed()
                );
            }
        }
    }

    if !report.is_complete() {
        println!("{}", "Schema verification found gaps.".yellow());
    }
}

/// Print the tables removed by reset.
pub fn print_reset_result(report: &ResetReport) {
    for name in &report.dropped {
        println!("  {} {}", "✗".red(), name);
    }
    println!(
        "{}",
        format!("Reset complete: dropped {} table(s).", report.dropped.len())
            .green()
            .bold()
    );
}

/// Print the removed record. The migration's schema changes stay in place.
pub fn print_rollback_result(report: &RollbackReport) {
    println!(
        "{}",
        format!(
            "Removed record for {} [{}]. It will be applied again on the next run.",
            report.filename, report.group
        )
        .green()
    );
    println!(
        "{}",
        "The migration's schema changes were NOT reverted.".yellow()
    );
}
