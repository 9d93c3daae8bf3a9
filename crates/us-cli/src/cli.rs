//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use us_core::{Dimension, GapDimensions};

/// Activity usage statistics.
///
/// Reconstructs work sessions from activity logs and reports the time spent
/// per course, module and activity.
#[derive(Debug, Parser)]
#[command(name = "use-stats", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Reconstruct sessions and per-module time for users.
    Sessions {
        /// User to report on (repeatable). Defaults to every active user.
        #[arg(long = "user")]
        users: Vec<i64>,

        /// Restrict to one course and apply its time credits.
        #[arg(long, default_value_t = 0)]
        course: i64,

        /// Window start (ISO 8601 or relative, e.g., "2 days ago").
        #[arg(long)]
        from: Option<String>,

        /// Window end (ISO 8601 or relative). Defaults to now.
        #[arg(long)]
        to: Option<String>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,

        /// Field to group time buckets by: module, course or user.
        #[arg(long, default_value_t = Dimension::Module)]
        dimension: Dimension,

        /// Log every per-event aggregation decision to stderr.
        #[arg(long)]
        trace: bool,
    },

    /// Site-wide totals from precomputed event gaps.
    Site {
        /// User to include (repeatable). Defaults to every user.
        #[arg(long = "user")]
        users: Vec<i64>,

        /// Course to include (repeatable). Defaults to every course.
        #[arg(long = "course")]
        courses: Vec<i64>,

        /// Window start (ISO 8601 or relative).
        #[arg(long)]
        from: Option<String>,

        /// Window end (ISO 8601 or relative). Defaults to now.
        #[arg(long)]
        to: Option<String>,

        /// Breakdowns to compute, comma separated.
        #[arg(long, default_value = "course,user,institution")]
        dimensions: GapDimensions,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Create the database schema at the configured path.
    Init,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_users() {
        let cli = Cli::parse_from([
            "use-stats", "sessions", "--user", "3", "--user", "4", "--course", "2", "--json",
        ]);
        let Some(Commands::Sessions {
            users,
            course,
            json,
            trace,
            dimension,
            ..
        }) = cli.command
        else {
            panic!("expected sessions command");
        };
        assert_eq!(users, vec![3, 4]);
        assert_eq!(course, 2);
        assert!(json);
        assert!(!trace);
        assert_eq!(dimension, Dimension::Module);
    }

    #[test]
    fn parses_aggregation_dimension() {
        let cli = Cli::parse_from(["use-stats", "sessions", "--dimension", "user"]);
        let Some(Commands::Sessions { dimension, .. }) = cli.command else {
            panic!("expected sessions command");
        };
        assert_eq!(dimension, Dimension::User);

        let err = Cli::try_parse_from(["use-stats", "sessions", "--dimension", "country"])
            .unwrap_err();
        assert!(err.to_string().contains("unknown aggregation dimension: country"));
    }

    #[test]
    fn site_dimensions_default_to_all() {
        let cli = Cli::parse_from(["use-stats", "site"]);
        let Some(Commands::Site { dimensions, .. }) = cli.command else {
            panic!("expected site command");
        };
        assert_eq!(dimensions, GapDimensions::default());
    }

    #[test]
    fn rejects_unknown_dimension() {
        let err =
            Cli::try_parse_from(["use-stats", "site", "--dimensions", "country"]).unwrap_err();
        assert!(err.to_string().contains("unknown gap dimension: country"));
    }
}
