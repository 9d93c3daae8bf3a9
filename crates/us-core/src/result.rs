//! Aggregation output: per-category time buckets and reconstructed sessions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::format::{format_time, format_timestamp};
use crate::normalize::COURSE_DIMENSION;

/// A bucket category.
///
/// Raw dimension values (module names and the `user`/`system` pseudo
/// dimensions) are keyed by course module id; the fixed categories are keyed
/// by course id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Dimension(String),
    Course,
    Activities,
    Other,
    CourseTotal,
}

impl Category {
    /// Category an event with the given dimension value is first recorded in.
    pub fn for_dimension(value: &str) -> Self {
        if value == COURSE_DIMENSION {
            Self::Course
        } else {
            Self::Dimension(value.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Dimension(name) => name,
            Self::Course => "course",
            Self::Activities => "activities",
            Self::Other => "other",
            Self::CourseTotal => "coursetotal",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Category {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Where a bucket's elapsed time came from when it was overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSource {
    Credit,
    Declared,
}

/// Accumulated time for one (category, key) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DimensionBucket {
    /// Seconds attributed to this bucket.
    pub elapsed: i64,
    pub events: i64,
    pub first_access: Option<i64>,
    pub last_access: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_source: Option<TimeSource>,
    /// `elapsed` rendered by [`format_time`].
    pub elapsed_display: String,
}

impl DimensionBucket {
    /// Adds one event's lap.
    pub fn record(&mut self, time: i64, lap: i64) {
        self.elapsed += lap;
        self.events += 1;
        self.first_access.get_or_insert(time);
        self.last_access = Some(time);
    }
}

/// One reconstructed session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Session {
    pub ordinal: usize,
    pub start: Option<i64>,
    pub end: Option<i64>,
    /// Seconds of attributed activity within the session.
    pub elapsed: i64,
    /// Distinct course ids touched during the session.
    pub courses: BTreeSet<i64>,
    pub start_display: String,
    pub end_display: String,
    pub duration_display: String,
}

impl Session {
    pub(crate) fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            ..Self::default()
        }
    }

    /// Wall-clock span between start and end.
    pub fn duration(&self) -> i64 {
        self.end.unwrap_or(0) - self.start.unwrap_or(0)
    }

    fn refresh_display(&mut self) {
        self.start_display = format_timestamp(self.start.unwrap_or(0));
        self.end_display = format_timestamp(self.end.unwrap_or(0));
        self.duration_display = format_time(self.duration());
    }
}

/// Non-fatal conditions surfaced during aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// `coursetotal` events differ from the sum of `course`, `activities`
    /// and `other`.
    EventSumMismatch { course_id: i64, total: i64, parts: i64 },
    /// Same as above for elapsed seconds.
    ElapsedSumMismatch { course_id: i64, total: i64, parts: i64 },
    /// The event carried no value for the aggregation dimension.
    UnknownDimension { event_id: i64 },
    /// A recorded total time could not be parsed.
    UnparseableRecordedTime { cmid: i64, value: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventSumMismatch {
                course_id,
                total,
                parts,
            } => write!(
                f,
                "bad sumcheck on events for course {course_id}: total {total}, parts {parts}"
            ),
            Self::ElapsedSumMismatch {
                course_id,
                total,
                parts,
            } => write!(
                f,
                "bad sumcheck on time for course {course_id}: total {total}s, parts {parts}s"
            ),
            Self::UnknownDimension { event_id } => {
                write!(f, "unknown dimension on event {event_id}")
            }
            Self::UnparseableRecordedTime { cmid, value } => {
                write!(f, "unparseable recorded time {value:?} for module {cmid}")
            }
        }
    }
}

/// Everything one aggregation pass produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateResult {
    pub buckets: BTreeMap<Category, BTreeMap<i64, DimensionBucket>>,
    pub sessions: Vec<Session>,
    pub diagnostics: Vec<Diagnostic>,
}

impl AggregateResult {
    pub fn category(&self, category: &Category) -> Option<&BTreeMap<i64, DimensionBucket>> {
        self.buckets.get(category)
    }

    pub fn bucket(&self, category: &Category, key: i64) -> Option<&DimensionBucket> {
        self.buckets.get(category)?.get(&key)
    }

    /// Returns the bucket, creating an empty one if needed.
    pub fn bucket_mut(&mut self, category: Category, key: i64) -> &mut DimensionBucket {
        self.buckets
            .entry(category)
            .or_default()
            .entry(key)
            .or_default()
    }

    /// Returns the session with the given ordinal, creating any missing ones.
    pub(crate) fn session_mut(&mut self, ordinal: usize) -> &mut Session {
        while self.sessions.len() <= ordinal {
            let next = self.sessions.len();
            self.sessions.push(Session::new(next));
        }
        &mut self.sessions[ordinal]
    }

    /// Checks that each course total reconciles with its parts.
    pub fn sum_check(&self) -> Vec<Diagnostic> {
        let Some(totals) = self.category(&Category::CourseTotal) else {
            return Vec::new();
        };
        let parts = [Category::Course, Category::Activities, Category::Other];

        let mut diagnostics = Vec::new();
        for (&course_id, total) in totals {
            let buckets: Vec<_> = parts
                .iter()
                .filter_map(|category| self.bucket(category, course_id))
                .collect();
            let events: i64 = buckets.iter().map(|b| b.events).sum();
            let elapsed: i64 = buckets.iter().map(|b| b.elapsed).sum();
            if total.events != events {
                diagnostics.push(Diagnostic::EventSumMismatch {
                    course_id,
                    total: total.events,
                    parts: events,
                });
            }
            if total.elapsed != elapsed {
                diagnostics.push(Diagnostic::ElapsedSumMismatch {
                    course_id,
                    total: total.elapsed,
                    parts: elapsed,
                });
            }
        }
        diagnostics
    }

    /// Recomputes every display string from the current numbers.
    pub fn refresh_display(&mut self) {
        for bucket in self.buckets.values_mut().flat_map(BTreeMap::values_mut) {
            bucket.elapsed_display = format_time(bucket.elapsed);
        }
        for session in &mut self.sessions {
            session.refresh_display();
        }
    }

    /// Sum of elapsed time over all sessions.
    pub fn total_session_time(&self) -> i64 {
        self.sessions.iter().map(|s| s.elapsed).sum()
    }
}
