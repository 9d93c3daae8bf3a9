//! Site command: totals from precomputed event gaps.

use std::fmt::Write as _;
use std::io::Write;

use anyhow::{Context, Result};
use us_core::{
    EventQuery, GapDimensions, HitBucket, SiteAggregate, compute_site_stats, format_time,
    format_timestamp,
};
use us_db::Database;

use crate::Config;

/// Computes site totals over the configured store.
///
/// A disabled log reader yields empty totals.
pub fn collect(
    config: &Config,
    query: &EventQuery,
    dimensions: GapDimensions,
) -> Result<SiteAggregate> {
    let db = Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?
        .with_reader(config.schema);
    let source = db.reader().map(|_| &db);
    compute_site_stats(source, query, dimensions, &config.aggregation())
        .context("failed to compute site statistics")
}

fn hit_line(output: &mut String, label: &str, bucket: &HitBucket) {
    let first = bucket.first_hit.map(format_timestamp).unwrap_or_default();
    let last = bucket.last_hit.map(format_timestamp).unwrap_or_default();
    writeln!(
        output,
        "  {label}: {} ({} events, {first} -> {last})",
        format_time(bucket.elapsed),
        bucket.events
    )
    .unwrap();
}

/// Formats site totals as human-readable text.
pub fn format_site(site: &SiteAggregate) -> String {
    let mut output = String::new();
    if site.all.events == 0 {
        writeln!(output, "No events in this window.").unwrap();
        return output;
    }

    writeln!(output, "SITE").unwrap();
    hit_line(&mut output, "all", &site.all);

    if !site.courses.is_empty() {
        writeln!(output, "COURSES").unwrap();
        for (course, bucket) in &site.courses {
            hit_line(&mut output, &course.to_string(), bucket);
        }
    }
    if !site.users.is_empty() {
        writeln!(output, "USERS").unwrap();
        for (user, bucket) in &site.users {
            hit_line(&mut output, &user.to_string(), bucket);
        }
    }
    if !site.institutions.is_empty() {
        writeln!(output, "INSTITUTIONS").unwrap();
        for (name, id) in &site.institution_ids {
            if let Some(bucket) = site.institutions.get(id) {
                let label = if name.is_empty() { "(none)" } else { name };
                hit_line(&mut output, label, bucket);
            }
        }
    }
    output
}

/// Runs the site command.
pub fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    query: &EventQuery,
    dimensions: GapDimensions,
    json: bool,
) -> Result<()> {
    let site = collect(config, query, dimensions)?;
    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&site)?)?;
    } else {
        write!(writer, "{}", format_site(&site))?;
    }
    Ok(())
}
