//! Site-wide totals from events carrying a precomputed gap.
//!
//! No sessions are reconstructed here: the storage layer already knows the
//! gap from each event to the user's next one, so a single pass with the
//! same threshold capping is enough.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::AggregationConfig;

/// An event paired with the gap to the user's next event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapEvent {
    pub id: i64,
    pub time: i64,
    pub user_id: i64,
    pub course_id: i64,
    /// Seconds to the next event; missing values count as zero.
    #[serde(default)]
    pub gap: Option<i64>,
    #[serde(default)]
    pub institution: String,
}

/// Breakdowns computed besides the overall total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapDimensions {
    pub course: bool,
    pub user: bool,
    pub institution: bool,
}

impl Default for GapDimensions {
    fn default() -> Self {
        Self {
            course: true,
            user: true,
            institution: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown gap dimension: {0}")]
pub struct UnknownGapDimension(String);

impl FromStr for GapDimensions {
    type Err = UnknownGapDimension;

    /// Parses a comma separated list such as `"course,user"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut dims = Self {
            course: false,
            user: false,
            institution: false,
        };
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part {
                "course" => dims.course = true,
                "user" => dims.user = true,
                "institution" => dims.institution = true,
                other => return Err(UnknownGapDimension(other.to_string())),
            }
        }
        Ok(dims)
    }
}

impl fmt::Display for GapDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (self.course, "course"),
            (self.user, "user"),
            (self.institution, "institution"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect();
        f.write_str(&names.join(","))
    }
}

/// Event count, elapsed time and hit window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HitBucket {
    pub events: i64,
    pub elapsed: i64,
    pub first_hit: Option<i64>,
    pub last_hit: Option<i64>,
}

impl HitBucket {
    fn record(&mut self, time: i64, gap: i64) {
        self.events += 1;
        self.elapsed += gap;
        self.first_hit.get_or_insert(time);
        self.last_hit = Some(time);
    }
}

/// Result of a site gap pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SiteAggregate {
    pub all: HitBucket,
    pub courses: BTreeMap<i64, HitBucket>,
    pub users: BTreeMap<i64, HitBucket>,
    /// Keyed by interned institution id.
    pub institutions: BTreeMap<i64, HitBucket>,
    /// Institution name to its interned id, assigned from 1 in first-seen order.
    pub institution_ids: BTreeMap<String, i64>,
}

impl SiteAggregate {
    /// Looks up an institution's totals by name.
    pub fn institution(&self, name: &str) -> Option<&HitBucket> {
        let id = self.institution_ids.get(name)?;
        self.institutions.get(id)
    }

    fn intern_institution(&mut self, name: &str) -> i64 {
        if let Some(&id) = self.institution_ids.get(name) {
            return id;
        }
        let id = i64::try_from(self.institution_ids.len()).unwrap_or(i64::MAX - 1) + 1;
        self.institution_ids.insert(name.to_string(), id);
        id
    }
}

/// Aggregates gap events into overall and per-dimension totals.
pub fn aggregate_gaps(
    events: &[GapEvent],
    dimensions: GapDimensions,
    config: &AggregationConfig,
) -> SiteAggregate {
    let mut site = SiteAggregate::default();

    for event in events {
        let mut gap = event.gap.unwrap_or(0);
        if gap > config.threshold {
            gap = config.last_ping_credit;
        }

        site.all.record(event.time, gap);

        if dimensions.course {
            site.courses
                .entry(event.course_id)
                .or_default()
                .record(event.time, gap);
        }
        if dimensions.user {
            site.users
                .entry(event.user_id)
                .or_default()
                .record(event.time, gap);
        }
        if dimensions.institution {
            let id = site.intern_institution(&event.institution);
            site.institutions
                .entry(id)
                .or_default()
                .record(event.time, gap);
        }
    }

    tracing::debug!(
        events = site.all.events,
        elapsed = site.all.elapsed,
        "site gap aggregation done"
    );
    site
}
