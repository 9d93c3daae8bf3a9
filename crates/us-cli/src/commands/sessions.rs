//! Sessions command: per-user session reconstruction and time buckets.

use std::fmt::Write as _;
use std::io::Write;

use anyhow::{Context, Result, anyhow};
use rayon::prelude::*;
use serde::Serialize;
use us_core::{
    AggregateResult, AggregationConfig, Dimension, EventQuery, TimeSource, UserQuery,
    compute_user_stats, format_time,
};
use us_db::Database;

use crate::Config;

/// What to compute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionsRequest {
    /// Empty means every user active in the window.
    pub users: Vec<i64>,
    /// 0 means every course, without time credits.
    pub course_id: i64,
    pub from: i64,
    pub to: i64,
    pub dimension: Dimension,
    pub trace: bool,
}

/// One user's statistics.
#[derive(Debug, Serialize)]
pub struct UserReport {
    pub user_id: i64,
    pub total_session_time: i64,
    #[serde(flatten)]
    pub result: AggregateResult,
}

fn open(config: &Config) -> Result<Database> {
    let db = Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    Ok(db.with_reader(config.schema))
}

/// Computes reports for every requested user, in parallel.
///
/// Each worker thread opens its own connection.
pub fn collect_reports(config: &Config, request: &SessionsRequest) -> Result<Vec<UserReport>> {
    let users = if request.users.is_empty() {
        let query = EventQuery {
            from: request.from,
            to: request.to,
            users: Vec::new(),
            courses: if request.course_id == 0 {
                Vec::new()
            } else {
                vec![request.course_id]
            },
        };
        open(config)?
            .list_active_users(&query)
            .context("failed to list active users")?
    } else {
        request.users.clone()
    };
    tracing::debug!(users = users.len(), "computing user statistics");

    let aggregation = AggregationConfig {
        trace: request.trace,
        ..config.aggregation()
    };
    let policy = config.overlay_policy();

    users
        .par_iter()
        .map_init(
            || open(config),
            |db, &user_id| -> Result<UserReport> {
                let db = db.as_ref().map_err(|err| anyhow!("{err:#}"))?;
                let query = UserQuery {
                    user_id,
                    course_id: request.course_id,
                    from: request.from,
                    to: request.to,
                    dimension: request.dimension,
                };
                let result = compute_user_stats(db, &query, &aggregation, policy)
                    .with_context(|| format!("failed to compute statistics for user {user_id}"))?;
                Ok(UserReport {
                    user_id,
                    total_session_time: result.total_session_time(),
                    result,
                })
            },
        )
        .collect()
}

/// Formats reports as human-readable text.
pub fn format_reports(reports: &[UserReport]) -> String {
    let mut output = String::new();
    if reports.is_empty() {
        writeln!(output, "No active users in this window.").unwrap();
        return output;
    }

    for (i, report) in reports.iter().enumerate() {
        if i > 0 {
            writeln!(output).unwrap();
        }
        let result = &report.result;
        writeln!(output, "User {}", report.user_id).unwrap();
        if result.sessions.is_empty() && result.buckets.is_empty() {
            writeln!(output, "  No activity.").unwrap();
            continue;
        }

        writeln!(
            output,
            "  Total session time: {}",
            format_time(report.total_session_time)
        )
        .unwrap();

        writeln!(output, "  Sessions:").unwrap();
        for session in &result.sessions {
            let courses: Vec<String> = session.courses.iter().map(ToString::to_string).collect();
            writeln!(
                output,
                "    #{} {} -> {} ({}), courses: {}",
                session.ordinal,
                session.start_display,
                session.end_display,
                format_time(session.elapsed),
                courses.join(", ")
            )
            .unwrap();
        }

        writeln!(output, "  Time by category:").unwrap();
        for (category, buckets) in &result.buckets {
            for (key, bucket) in buckets {
                write!(
                    output,
                    "    {category}/{key}: {} ({} events)",
                    bucket.elapsed_display, bucket.events
                )
                .unwrap();
                if let Some(source) = bucket.time_source {
                    let source = match source {
                        TimeSource::Credit => "credit",
                        TimeSource::Declared => "declared",
                    };
                    write!(output, " [{source}]").unwrap();
                }
                writeln!(output).unwrap();
            }
        }

        if !result.diagnostics.is_empty() {
            writeln!(output, "  Diagnostics:").unwrap();
            for diagnostic in &result.diagnostics {
                writeln!(output, "    - {diagnostic}").unwrap();
            }
        }
    }
    output
}

/// Runs the sessions command.
pub fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    request: &SessionsRequest,
    json: bool,
) -> Result<()> {
    let reports = collect_reports(config, request)?;
    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&reports)?)?;
    } else {
        write!(writer, "{}", format_reports(&reports))?;
    }
    Ok(())
}
