//! Merges externally supplied time records into an aggregate.
//!
//! Two override channels exist: manual time credits and self-declared times.
//! Each is configured independently to either replace the measured time
//! outright or only raise it.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::result::{AggregateResult, Category, Diagnostic, TimeSource};

/// Category whose activities record their own total time.
pub const SCORM_MODULE: &str = "scorm";

/// Matches `HH:MM:SS.` inside a recorded total time value.
static RECORDED_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d\d):(\d\d):(\d\d)\.").expect("valid recorded time regex"));

/// How an override record is merged into its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Replace elapsed time even when the measured time is higher.
    Strict,
    /// Only raise elapsed time up to the override value.
    #[default]
    MaxMerge,
}

/// Merge policy for each override channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OverlayPolicy {
    pub credits: MergePolicy,
    pub declared: MergePolicy,
}

impl OverlayPolicy {
    pub const fn from_flags(strict_credits: bool, strict_declared: bool) -> Self {
        const fn policy(strict: bool) -> MergePolicy {
            if strict {
                MergePolicy::Strict
            } else {
                MergePolicy::MaxMerge
            }
        }
        Self {
            credits: policy(strict_credits),
            declared: policy(strict_declared),
        }
    }
}

/// An activity instance that hands out credited or declared times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditInstance {
    pub id: i64,
    /// Course module id of the instance itself.
    pub cmid: i64,
}

/// One credited or declared time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRecord {
    /// Module name of the credited activity; selects the bucket category.
    pub modname: String,
    /// Credited course module; 0 means the owning instance as a whole.
    pub cmid: i64,
    /// Credited seconds.
    pub seconds: i64,
}

impl TimeRecord {
    /// Resolves a zero cmid to the owning instance's module.
    pub fn resolved(mut self, instance: &CreditInstance) -> Self {
        if self.cmid == 0 {
            self.cmid = instance.cmid;
        }
        self
    }
}

/// Merges one override record into the aggregate.
pub fn apply_override(
    result: &mut AggregateResult,
    record: &TimeRecord,
    source: TimeSource,
    policy: MergePolicy,
) {
    let bucket = result.bucket_mut(Category::for_dimension(&record.modname), record.cmid);
    match policy {
        MergePolicy::Strict => {
            bucket.elapsed = record.seconds;
            bucket.time_source = Some(source);
        }
        MergePolicy::MaxMerge => {
            if bucket.elapsed <= record.seconds {
                bucket.elapsed = record.seconds;
                bucket.time_source = Some(source);
            }
        }
    }
}

/// Applies all credit records, then all declared records.
pub fn apply_overlay(
    result: &mut AggregateResult,
    credits: &[TimeRecord],
    declared: &[TimeRecord],
    policy: OverlayPolicy,
) {
    for record in credits {
        apply_override(result, record, TimeSource::Credit, policy.credits);
    }
    for record in declared {
        apply_override(result, record, TimeSource::Declared, policy.declared);
    }
    result.refresh_display();
}

/// Seconds in a recorded total time such as `00:12:30.45`.
pub fn parse_recorded_time(value: &str) -> Option<i64> {
    let caps = RECORDED_TIME_RE.captures(value)?;
    let hours: i64 = caps[1].parse().ok()?;
    let minutes: i64 = caps[2].parse().ok()?;
    let seconds: i64 = caps[3].parse().ok()?;
    Some(hours * 3600 + minutes * 60 + seconds)
}

/// Total times an activity recorded for itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordedTimes {
    pub course_id: i64,
    /// Raw `HH:MM:SS.cc` values.
    pub values: Vec<String>,
}

/// Raises a self-timed activity bucket to its recorded total.
///
/// The difference is also added to the course's `coursetotal` and
/// `activities` buckets so that the course sums stay reconciled.
pub fn apply_recorded_time(result: &mut AggregateResult, cmid: i64, recorded: &RecordedTimes) {
    let mut total = 0;
    for value in &recorded.values {
        match parse_recorded_time(value) {
            Some(seconds) => total += seconds,
            None => {
                tracing::warn!(cmid, %value, "unparseable recorded time");
                result.diagnostics.push(Diagnostic::UnparseableRecordedTime {
                    cmid,
                    value: value.clone(),
                });
            }
        }
    }

    let category = Category::Dimension(SCORM_MODULE.to_string());
    let Some(bucket) = result.buckets.get_mut(&category).and_then(|b| b.get_mut(&cmid)) else {
        return;
    };
    if bucket.elapsed >= total {
        return;
    }
    let diff = total - bucket.elapsed;
    bucket.elapsed += diff;
    result
        .bucket_mut(Category::CourseTotal, recorded.course_id)
        .elapsed += diff;
    result
        .bucket_mut(Category::Activities, recorded.course_id)
        .elapsed += diff;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(modname: &str, cmid: i64, seconds: i64) -> TimeRecord {
        TimeRecord {
            modname: modname.to_string(),
            cmid,
            seconds,
        }
    }

    fn quiz() -> Category {
        Category::Dimension("quiz".to_string())
    }

    fn measured(elapsed: i64) -> AggregateResult {
        let mut result = AggregateResult::default();
        result.bucket_mut(quiz(), 5).record(100, elapsed);
        result
    }

    #[test]
    fn max_merge_raises_lower_time() {
        let mut result = measured(300);
        apply_override(
            &mut result,
            &record("quiz", 5, 600),
            TimeSource::Credit,
            MergePolicy::MaxMerge,
        );
        let bucket = result.bucket(&quiz(), 5).unwrap();
        assert_eq!(bucket.elapsed, 600);
        assert_eq!(bucket.events, 1);
        assert_eq!(bucket.time_source, Some(TimeSource::Credit));
    }

    #[test]
    fn max_merge_keeps_higher_time() {
        let mut result = measured(900);
        apply_override(
            &mut result,
            &record("quiz", 5, 600),
            TimeSource::Credit,
            MergePolicy::MaxMerge,
        );
        let bucket = result.bucket(&quiz(), 5).unwrap();
        assert_eq!(bucket.elapsed, 900);
        assert_eq!(bucket.time_source, None);
    }

    #[test]
    fn max_merge_creates_missing_bucket() {
        let mut result = AggregateResult::default();
        apply_override(
            &mut result,
            &record("quiz", 8, 120),
            TimeSource::Declared,
            MergePolicy::MaxMerge,
        );
        let bucket = result.bucket(&quiz(), 8).unwrap();
        assert_eq!(bucket.elapsed, 120);
        assert_eq!(bucket.events, 0);
        assert_eq!(bucket.time_source, Some(TimeSource::Declared));
    }

    #[test]
    fn strict_replaces_higher_time() {
        let mut result = measured(900);
        apply_override(
            &mut result,
            &record("quiz", 5, 600),
            TimeSource::Credit,
            MergePolicy::Strict,
        );
        let bucket = result.bucket(&quiz(), 5).unwrap();
        assert_eq!(bucket.elapsed, 600);
        assert_eq!(bucket.time_source, Some(TimeSource::Credit));
    }

    #[test]
    fn declared_applies_after_credit() {
        let mut result = measured(100);
        apply_overlay(
            &mut result,
            &[record("quiz", 5, 400)],
            &[record("quiz", 5, 500)],
            OverlayPolicy::default(),
        );
        let bucket = result.bucket(&quiz(), 5).unwrap();
        assert_eq!(bucket.elapsed, 500);
        assert_eq!(bucket.time_source, Some(TimeSource::Declared));
        assert_eq!(bucket.elapsed_display, "8m 20s");
    }

    #[test]
    fn max_merge_overlay_is_idempotent() {
        let credits = [record("quiz", 5, 400), record("page", 9, 60)];
        let declared = [record("quiz", 5, 350)];

        let mut once = measured(100);
        apply_overlay(&mut once, &credits, &declared, OverlayPolicy::default());
        let mut twice = once.clone();
        apply_overlay(&mut twice, &credits, &declared, OverlayPolicy::default());

        assert_eq!(once, twice);
    }

    #[test]
    fn zero_cmid_resolves_to_instance() {
        let instance = CreditInstance { id: 3, cmid: 77 };
        assert_eq!(record("learningtimecheck", 0, 10).resolved(&instance).cmid, 77);
        assert_eq!(record("quiz", 5, 10).resolved(&instance).cmid, 5);
    }

    #[test]
    fn policy_from_flags() {
        let policy = OverlayPolicy::from_flags(true, false);
        assert_eq!(policy.credits, MergePolicy::Strict);
        assert_eq!(policy.declared, MergePolicy::MaxMerge);
    }

    #[test]
    fn parses_recorded_times() {
        assert_eq!(parse_recorded_time("00:12:30.45"), Some(750));
        assert_eq!(parse_recorded_time("01:00:00.00"), Some(3600));
        assert_eq!(parse_recorded_time("PT12M30S"), None);
    }

    #[test]
    fn recorded_time_raises_scorm_and_course_totals() {
        let scorm = Category::Dimension(SCORM_MODULE.to_string());
        let mut result = AggregateResult::default();
        result.bucket_mut(scorm.clone(), 4).record(10, 100);
        result.bucket_mut(Category::Activities, 2).record(10, 100);
        result.bucket_mut(Category::CourseTotal, 2).record(10, 100);

        let recorded = RecordedTimes {
            course_id: 2,
            values: vec!["00:05:00.00".to_string(), "bogus".to_string()],
        };
        apply_recorded_time(&mut result, 4, &recorded);

        assert_eq!(result.bucket(&scorm, 4).unwrap().elapsed, 300);
        assert_eq!(result.bucket(&Category::Activities, 2).unwrap().elapsed, 300);
        assert_eq!(result.bucket(&Category::CourseTotal, 2).unwrap().elapsed, 300);
        assert!(result.sum_check().is_empty());
        assert_eq!(
            result.diagnostics,
            vec![Diagnostic::UnparseableRecordedTime {
                cmid: 4,
                value: "bogus".to_string()
            }]
        );
    }

    #[test]
    fn recorded_time_never_lowers() {
        let scorm = Category::Dimension(SCORM_MODULE.to_string());
        let mut result = AggregateResult::default();
        result.bucket_mut(scorm.clone(), 4).record(10, 900);

        let recorded = RecordedTimes {
            course_id: 2,
            values: vec!["00:05:00.00".to_string()],
        };
        apply_recorded_time(&mut result, 4, &recorded);

        assert_eq!(result.bucket(&scorm, 4).unwrap().elapsed, 900);
        assert!(result.category(&Category::CourseTotal).is_none());
    }
}
