//! Session reconstruction and per-dimension time aggregation.
//!
//! Log streams rarely say when a user stopped working, so sessions are
//! inferred from the gaps between events.
//!
//! # Algorithm Summary
//!
//! 1. Each event owns the lap up to the next event; the last event is
//!    credited `last_ping_credit`. Laps over `threshold` are capped to
//!    `last_ping_credit` and, unless a login follows, punch a session break.
//! 2. Logouts close the session; failed system events are dropped.
//! 3. Events outside the capture list, inside the ignore list, or grading
//!    side effects do not get time of their own: their lap is carried as
//!    spillover until an eligible event or a session close absorbs it.
//! 4. Remaining laps drive the session automaton and are recorded in the
//!    dimension bucket, the `activities`/`other` split and `coursetotal`.

use std::fmt;
use std::mem;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{Action, NormalizedEvent};
use crate::normalize::{SYSTEM_DIMENSION, UNDEFINED_DIMENSION};
use crate::result::{AggregateResult, Category, Diagnostic, Session};

/// Configuration for session aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationConfig {
    /// Largest gap between two events still counted as continuous work, in
    /// seconds. Default: 900 (15 minutes).
    pub threshold: i64,

    /// Seconds credited to the last event of a session, and to any lap
    /// capped for exceeding `threshold`. Default: 900 (15 minutes).
    pub last_ping_credit: i64,

    /// When non-empty, only these modules receive time of their own.
    pub capture_modules: Vec<String>,

    /// Modules that never receive time of their own.
    pub ignore_modules: Vec<String>,

    /// Emit a debug record for every per-event decision.
    pub trace: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self::from_minutes(15, 15)
    }
}

impl AggregationConfig {
    /// Builds a configuration from minute values, as they are usually stored.
    ///
    /// Values too large to express in seconds saturate.
    pub const fn from_minutes(threshold: i64, last_ping_credit: i64) -> Self {
        Self {
            threshold: threshold.saturating_mul(60),
            last_ping_credit: last_ping_credit.saturating_mul(60),
            capture_modules: Vec::new(),
            ignore_modules: Vec::new(),
            trace: false,
        }
    }

    fn is_excluded_module(&self, module: &str) -> bool {
        let not_captured = !self.capture_modules.is_empty()
            && !self.capture_modules.iter().any(|m| m == module);
        let ignored = self.ignore_modules.iter().any(|m| m == module);
        not_captured || ignored
    }
}

/// The event field buckets are grouped by.
///
/// Capture and ignore lists only apply when grouping by module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    /// Module name, or the `user`/`system`/`course` pseudo values.
    #[default]
    Module,
    /// Course id, rendered as text.
    Course,
    /// User id, rendered as text.
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown aggregation dimension: {0}")]
pub struct UnknownDimension(String);

impl Dimension {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Course => "course",
            Self::User => "user",
        }
    }

    fn value(self, event: &NormalizedEvent) -> Option<String> {
        match self {
            Self::Module => event.module.clone(),
            Self::Course => Some(event.course_id.to_string()),
            Self::User => Some(event.user_id.to_string()),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = UnknownDimension;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "module" => Ok(Self::Module),
            "course" => Ok(Self::Course),
            "user" => Ok(Self::User),
            other => Err(UnknownDimension(other.to_string())),
        }
    }
}

/// Aggregates time-ordered events into sessions and dimension buckets.
///
/// Events must be sorted by time ascending and already normalized.
///
/// # Arguments
///
/// * `events` - Normalized events of a single user's timeline
/// * `dimension` - Field that names the first-level bucket category
/// * `config` - Thresholds and module filters
///
/// # Returns
///
/// Buckets, sessions with display strings, and any sum-check diagnostics.
pub fn aggregate(
    events: &[NormalizedEvent],
    dimension: Dimension,
    config: &AggregationConfig,
) -> AggregateResult {
    let Some(first) = events.first() else {
        return AggregateResult::default();
    };

    let mut pass = Pass::new(config, dimension, first.time);
    let mut window = events.iter().peekable();
    while let Some(event) = window.next() {
        pass.step(event, window.peek().copied());
    }
    pass.finish()
}

/// State carried from one event to the next.
struct Pass<'a> {
    config: &'a AggregationConfig,
    dimension: Dimension,
    /// Time of the first event in the stream, used to repair session 0.
    stream_start: i64,
    session_id: usize,
    /// Time deferred from events that were not attributed.
    mem_lap: i64,
    /// Time and final lap of the latest event that was not dropped.
    last: Option<(i64, i64)>,
    /// Whether the latest event was an explicit logout.
    closed_by_logout: bool,
    result: AggregateResult,
}

impl<'a> Pass<'a> {
    fn new(config: &'a AggregationConfig, dimension: Dimension, stream_start: i64) -> Self {
        Self {
            config,
            dimension,
            stream_start,
            session_id: 0,
            mem_lap: 0,
            last: None,
            closed_by_logout: false,
            result: AggregateResult::default(),
        }
    }

    fn trace(&self, event: &NormalizedEvent, lap: i64, decision: &str) {
        if self.config.trace {
            tracing::debug!(
                session = self.session_id,
                event = event.id,
                time = event.time,
                module = event.module.as_deref().unwrap_or(UNDEFINED_DIMENSION),
                cmid = event.cmid,
                action = %event.action,
                lap,
                "{decision}"
            );
        }
    }

    #[allow(clippy::too_many_lines)]
    fn step(&mut self, event: &NormalizedEvent, next: Option<&NormalizedEvent>) {
        let next_is_login = next.is_some_and(|n| n.action.starts_session());

        let mut lap = next.map_or(self.config.last_ping_credit, |n| n.time - event.time);
        let mut punch = false;
        if lap > self.config.threshold {
            lap = self.config.last_ping_credit;
            punch = next.is_some() && !next_is_login;
        }

        let value = self.dimension.value(event);
        let key = value.as_deref().unwrap_or(UNDEFINED_DIMENSION);

        if key == SYSTEM_DIMENSION && event.action == Action::Failed {
            self.trace(event, lap, "failed system event, dropped");
            return;
        }

        let previous = self.last.replace((event.time, lap));
        self.closed_by_logout = false;

        if event.action == Action::LoggedOut {
            let spill = mem::take(&mut self.mem_lap);
            let session = self.open_session();
            session.elapsed += spill;
            session.end = Some(event.time);
            self.closed_by_logout = true;
            self.trace(event, lap, "finish session on clean logout");
            return;
        }

        if self.dimension == Dimension::Module && event.action != Action::Login {
            let graded_bias =
                event.action == Action::Graded && event.target.as_deref() == Some("user");
            if self.config.is_excluded_module(key) || graded_bias {
                if next_is_login {
                    let spill = lap + mem::take(&mut self.mem_lap);
                    let session = self.open_session();
                    session.elapsed += spill;
                    session.end = Some(event.time + spill);
                    self.trace(event, lap, "not eligible, spillover closes session");
                } else {
                    self.mem_lap += lap;
                    self.trace(event, lap, "not eligible, time lapped");
                }
                return;
            }
        }

        // Spillover stays pending across a repeated login.
        if event.action == Action::Login && next_is_login {
            self.trace(event, lap, "login followed by login, ignored");
            return;
        }

        lap += mem::take(&mut self.mem_lap);
        self.last = Some((event.time, lap));

        if value.is_none() {
            tracing::warn!(event_id = event.id, "unknown dimension");
            self.result
                .diagnostics
                .push(Diagnostic::UnknownDimension { event_id: event.id });
        }

        // A stream that starts mid-session gets session 0 opened at its
        // first record.
        let mut preinit = false;
        if self.session_id == 0 {
            let session = self.result.session_mut(0);
            if session.start.is_none() {
                session.start = Some(self.stream_start);
                preinit = true;
            }
        }

        self.result
            .session_mut(self.session_id)
            .courses
            .insert(event.course_id);

        if event.action == Action::Login {
            if !preinit || self.session_id != 0 {
                self.close_session(previous);
                self.session_id += 1;
            }
            let session = self.result.session_mut(self.session_id);
            session.elapsed = lap;
            session.start = Some(event.time);
            self.trace(event, lap, "login, start session");
        } else if next_is_login || punch {
            let session = self.result.session_mut(self.session_id);
            session.elapsed += lap;
            session.end = Some(event.time + lap);
            self.trace(event, lap, "last record of session");

            if let Some(next) = next.filter(|n| punch && n.action != Action::Failed) {
                self.session_id += 1;
                let session = self.result.session_mut(self.session_id);
                session.start = Some(next.time);
                session.elapsed = 0;
                self.trace(event, lap, "inactivity gap, start simulated session");
            }
        } else {
            let session = self.result.session_mut(self.session_id);
            session.start.get_or_insert(event.time);
            session.elapsed += lap;
            self.trace(event, lap, "add lap to session");
        }

        self.record_buckets(event, key, lap);
    }

    /// The current session, started at the stream start if nothing opened it.
    ///
    /// Only session 0 can be reached without a start: later sessions are
    /// opened by a login or an inactivity gap.
    fn open_session(&mut self) -> &mut Session {
        let stream_start = self.stream_start;
        let session = self.result.session_mut(self.session_id);
        session.start.get_or_insert(stream_start);
        session
    }

    /// Ends the current session after `previous` unless something already did.
    fn close_session(&mut self, previous: Option<(i64, i64)>) {
        let session = self.result.session_mut(self.session_id);
        if session.end.is_none() {
            if let Some((time, lap)) = previous {
                session.end = Some(time + lap);
            }
        }
    }

    fn record_buckets(&mut self, event: &NormalizedEvent, key: &str, lap: i64) {
        let category = Category::for_dimension(key);
        let split = match category {
            Category::Course => None,
            _ if event.cmid != 0 => Some(Category::Activities),
            _ => Some(Category::Other),
        };
        let bucket_key = if category == Category::Course {
            event.course_id
        } else {
            event.cmid
        };

        self.result
            .bucket_mut(category, bucket_key)
            .record(event.time, lap);
        if let Some(split) = split {
            self.result
                .bucket_mut(split, event.course_id)
                .record(event.time, lap);
        }
        self.result
            .bucket_mut(Category::CourseTotal, event.course_id)
            .record(event.time, lap);
    }

    fn finish(mut self) -> AggregateResult {
        // Spillover left at the end of the stream belongs to the open session.
        let spill = mem::take(&mut self.mem_lap);
        if spill > 0 {
            let session = self.result.session_mut(self.session_id);
            session.start.get_or_insert(self.stream_start);
            session.elapsed += spill;
        }

        if !self.result.sessions.is_empty() && !self.closed_by_logout {
            if let Some((time, lap)) = self.last {
                self.result.session_mut(self.session_id).end = Some(time + lap);
            }
        }

        let mismatches = self.result.sum_check();
        for diagnostic in &mismatches {
            tracing::warn!("{diagnostic}");
        }
        self.result.diagnostics.extend(mismatches);
        self.result.refresh_display();
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000;
    const COURSE: i64 = 7;

    fn ev(id: i64, offset: i64, module: &str, cmid: i64, action: &str) -> NormalizedEvent {
        NormalizedEvent {
            id,
            time: T0 + offset,
            user_id: 2,
            course_id: COURSE,
            module: Some(module.to_string()),
            cmid,
            action: Action::from(action),
            target: None,
        }
    }

    fn login(id: i64, offset: i64) -> NormalizedEvent {
        ev(id, offset, "user", 0, "login")
    }

    fn logout(id: i64, offset: i64) -> NormalizedEvent {
        ev(id, offset, "user", 0, "loggedout")
    }

    fn view(id: i64, offset: i64, module: &str, cmid: i64) -> NormalizedEvent {
        ev(id, offset, module, cmid, "viewed")
    }

    fn config() -> AggregationConfig {
        AggregationConfig::from_minutes(15, 15)
    }

    fn dim(name: &str) -> Category {
        Category::Dimension(name.to_string())
    }

    fn elapsed(result: &AggregateResult, category: &Category, key: i64) -> i64 {
        result
            .bucket(category, key)
            .unwrap_or_else(|| panic!("missing bucket {category}/{key}"))
            .elapsed
    }

    fn span(session: &Session) -> (i64, i64, i64) {
        (
            session.start.unwrap() - T0,
            session.end.unwrap() - T0,
            session.elapsed,
        )
    }

    #[test]
    fn test_empty_events() {
        let result = aggregate(&[], Dimension::Module, &config());
        assert!(result.buckets.is_empty());
        assert!(result.sessions.is_empty());
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn test_login_view_logout() {
        let events = vec![login(1, 0), view(2, 300, "page", 11), logout(3, 900)];
        let result = aggregate(&events, Dimension::Module, &config());

        assert_eq!(result.sessions.len(), 1);
        assert_eq!(span(&result.sessions[0]), (0, 900, 900));

        // Login lap goes to the user pseudo dimension, view lap to the page.
        assert_eq!(elapsed(&result, &dim("user"), 0), 300);
        assert_eq!(elapsed(&result, &dim("page"), 11), 600);
        assert_eq!(elapsed(&result, &Category::Other, COURSE), 300);
        assert_eq!(elapsed(&result, &Category::Activities, COURSE), 600);
        assert_eq!(elapsed(&result, &Category::CourseTotal, COURSE), 900);
        assert_eq!(
            result
                .bucket(&Category::CourseTotal, COURSE)
                .unwrap()
                .events,
            2
        );
        assert!(result.diagnostics.is_empty());
        assert_eq!(result.sessions[0].duration_display, "15m 0s");
    }

    #[test]
    fn test_inactivity_gap_punches_session() {
        let events = vec![
            view(1, 0, "course", 0),
            view(2, 100, "course", 0),
            view(3, 5000, "course", 0),
        ];
        let result = aggregate(&events, Dimension::Module, &config());

        assert_eq!(result.sessions.len(), 2);
        assert_eq!(span(&result.sessions[0]), (0, 1000, 1000));
        assert_eq!(span(&result.sessions[1]), (5000, 5900, 900));
        assert_eq!(elapsed(&result, &Category::Course, COURSE), 1900);
        assert_eq!(elapsed(&result, &Category::CourseTotal, COURSE), 1900);
    }

    #[test]
    fn test_gap_before_login_does_not_synthesize() {
        let events = vec![
            login(1, 0),
            view(2, 60, "page", 11),
            login(3, 5000),
            view(4, 5100, "page", 11),
        ];
        let result = aggregate(&events, Dimension::Module, &config());

        assert_eq!(result.sessions.len(), 2);
        // The capped lap closes session 0 as an implicit logout.
        assert_eq!(span(&result.sessions[0]), (0, 960, 960));
        assert_eq!(span(&result.sessions[1]), (5000, 6000, 1000));
    }

    #[test]
    fn test_gap_before_failed_does_not_synthesize() {
        let mut failed = view(2, 2000, "system", 0);
        failed.action = Action::Failed;
        let events = vec![view(1, 0, "page", 11), failed];
        let result = aggregate(&events, Dimension::Module, &config());

        assert_eq!(result.sessions.len(), 1);
        assert_eq!(span(&result.sessions[0]), (0, 900, 900));
        assert!(result.bucket(&dim("system"), 0).is_none());
    }

    #[test]
    fn test_ignored_module_spills_into_next_event() {
        let mut cfg = AggregationConfig::from_minutes(15, 10);
        cfg.ignore_modules = vec!["forum".to_string()];
        let events = vec![
            login(1, 0),
            view(2, 100, "forum", 21),
            view(3, 400, "page", 11),
            logout(4, 1000),
        ];
        let result = aggregate(&events, Dimension::Module, &cfg);

        assert!(result.bucket(&dim("forum"), 21).is_none());
        // Forum lap (300) joins the page lap (600).
        assert_eq!(elapsed(&result, &dim("page"), 11), 900);
        assert_eq!(span(&result.sessions[0]), (0, 1000, 1000));
        assert_eq!(elapsed(&result, &Category::CourseTotal, COURSE), 1000);
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn test_capture_list_spills_uncaptured_modules() {
        let mut cfg = config();
        cfg.capture_modules = vec!["quiz".to_string()];
        let events = vec![
            view(1, 0, "page", 11),
            view(2, 120, "quiz", 12),
            view(3, 300, "page", 11),
        ];
        let result = aggregate(&events, Dimension::Module, &cfg);

        assert!(result.bucket(&dim("page"), 11).is_none());
        // 120 from the first page + 180 of its own.
        assert_eq!(elapsed(&result, &dim("quiz"), 12), 300);
        // Trailing spillover lands in the session but in no bucket.
        assert_eq!(span(&result.sessions[0]), (0, 1200, 1200));
        assert_eq!(elapsed(&result, &Category::CourseTotal, COURSE), 300);
    }

    #[test]
    fn test_excluded_event_before_login_closes_session() {
        let mut cfg = config();
        cfg.ignore_modules = vec!["forum".to_string()];
        let events = vec![
            login(1, 0),
            view(2, 100, "forum", 21),
            view(3, 200, "forum", 21),
            login(4, 500),
            logout(5, 600),
        ];
        let result = aggregate(&events, Dimension::Module, &cfg);

        assert_eq!(result.sessions.len(), 2);
        // 100 from the login, then 100 spilled + 300 own lap.
        assert_eq!(span(&result.sessions[0]), (0, 600, 500));
        assert_eq!(span(&result.sessions[1]), (500, 600, 100));
    }

    #[test]
    fn test_graded_user_event_is_not_activity() {
        let mut graded = ev(2, 100, "assign", 31, "graded");
        graded.target = Some("user".to_string());
        let events = vec![view(1, 0, "assign", 31), graded, view(3, 400, "assign", 31)];
        let result = aggregate(&events, Dimension::Module, &config());

        let bucket = result.bucket(&dim("assign"), 31).unwrap();
        assert_eq!(bucket.events, 2);
        assert_eq!(bucket.elapsed, 100 + 300 + 900);
    }

    #[test]
    fn test_graded_with_other_target_counts() {
        let mut graded = ev(2, 100, "assign", 31, "graded");
        graded.target = Some("submission".to_string());
        let events = vec![view(1, 0, "assign", 31), graded];
        let result = aggregate(&events, Dimension::Module, &config());

        assert_eq!(result.bucket(&dim("assign"), 31).unwrap().events, 2);
    }

    #[test]
    fn test_logout_flushes_spillover() {
        let mut cfg = config();
        cfg.ignore_modules = vec!["forum".to_string()];
        let events = vec![login(1, 0), view(2, 100, "forum", 21), logout(3, 400)];
        let result = aggregate(&events, Dimension::Module, &cfg);

        assert_eq!(span(&result.sessions[0]), (0, 400, 400));
    }

    #[test]
    fn test_stream_without_login_repairs_session_zero() {
        let events = vec![view(1, 0, "page", 11), view(2, 60, "page", 11)];
        let result = aggregate(&events, Dimension::Module, &config());

        assert_eq!(result.sessions.len(), 1);
        assert_eq!(span(&result.sessions[0]), (0, 960, 960));
    }

    #[test]
    fn test_first_login_does_not_increment() {
        let events = vec![login(1, 0), view(2, 60, "page", 11)];
        let result = aggregate(&events, Dimension::Module, &config());

        assert_eq!(result.sessions.len(), 1);
        assert_eq!(result.sessions[0].ordinal, 0);
        assert_eq!(span(&result.sessions[0]), (0, 960, 960));
    }

    #[test]
    fn test_session_started_mid_stream_then_login() {
        let events = vec![
            view(1, 0, "page", 11),
            view(2, 60, "page", 11),
            login(3, 120),
            view(4, 180, "page", 11),
        ];
        let result = aggregate(&events, Dimension::Module, &config());

        assert_eq!(result.sessions.len(), 2);
        assert_eq!(span(&result.sessions[0]), (0, 120, 120));
        assert_eq!(span(&result.sessions[1]), (120, 1080, 960));
    }

    #[test]
    fn test_duplicate_login_is_skipped() {
        let events = vec![login(1, 0), login(2, 5), view(3, 65, "page", 11)];
        let result = aggregate(&events, Dimension::Module, &config());

        assert_eq!(result.sessions.len(), 1);
        assert_eq!(span(&result.sessions[0]), (5, 965, 960));
        // Only the second login is recorded.
        assert_eq!(result.bucket(&dim("user"), 0).unwrap().events, 1);
        assert_eq!(elapsed(&result, &dim("user"), 0), 60);
    }

    #[test]
    fn test_loggedin_lookahead_suppresses_punch() {
        let mut relogin = login(3, 5000);
        relogin.action = Action::LoggedIn;
        let events = vec![view(1, 0, "page", 11), view(2, 100, "page", 11), relogin];
        let result = aggregate(&events, Dimension::Module, &config());

        // No simulated session: the gap ends in a login.
        assert_eq!(result.sessions.len(), 1);
        assert_eq!(result.sessions[0].elapsed, 1900);
    }

    #[test]
    fn test_failed_system_event_is_dropped() {
        let mut failed = view(2, 100, "system", 0);
        failed.action = Action::Failed;
        let events = vec![view(1, 0, "page", 11), failed, view(3, 200, "page", 11)];
        let result = aggregate(&events, Dimension::Module, &config());

        assert!(result.bucket(&dim("system"), 0).is_none());
        // The dropped lap is not carried.
        assert_eq!(elapsed(&result, &dim("page"), 11), 100 + 900);
    }

    #[test]
    fn test_course_dimension_buckets_by_course() {
        let events = vec![view(1, 0, "course", 0), view(2, 50, "course", 0)];
        let result = aggregate(&events, Dimension::Module, &config());

        assert_eq!(elapsed(&result, &Category::Course, COURSE), 950);
        assert!(result.category(&Category::Other).is_none());
        assert!(result.category(&Category::Activities).is_none());
    }

    #[test]
    fn test_sum_invariant_holds_across_categories() {
        let mut other_course = view(4, 500, "quiz", 40);
        other_course.course_id = 8;
        let events = vec![
            login(1, 0),
            view(2, 100, "course", 0),
            view(3, 250, "page", 11),
            other_course,
            view(5, 700, "user", 0),
            logout(6, 800),
        ];
        let result = aggregate(&events, Dimension::Module, &config());

        assert!(result.diagnostics.is_empty());
        assert_eq!(result.sum_check(), Vec::<Diagnostic>::new());
        for buckets in result.buckets.values() {
            for bucket in buckets.values() {
                assert!(bucket.elapsed >= 0);
                assert!(bucket.events >= 1);
            }
        }
        assert_eq!(result.sessions[0].courses.len(), 2);
    }

    #[test]
    fn test_unknown_module_is_reported() {
        let mut unknown = view(1, 0, "page", 11);
        unknown.module = None;
        let result = aggregate(&[unknown], Dimension::Module, &config());

        assert_eq!(
            result.diagnostics,
            vec![Diagnostic::UnknownDimension { event_id: 1 }]
        );
        assert_eq!(elapsed(&result, &dim("undefined"), 11), 900);
    }

    #[test]
    fn test_filters_only_apply_to_module_dimension() {
        let mut cfg = config();
        cfg.ignore_modules = vec!["forum".to_string()];
        let events = vec![view(1, 0, "forum", 21), view(2, 100, "page", 11)];
        let result = aggregate(&events, Dimension::Course, &cfg);

        let by_course = dim(&COURSE.to_string());
        assert_eq!(result.bucket(&by_course, 21).unwrap().elapsed, 100);
        assert_eq!(result.bucket(&by_course, 11).unwrap().elapsed, 900);
    }

    fn failed_system(id: i64, offset: i64) -> NormalizedEvent {
        ev(id, offset, "system", 0, "failed")
    }

    fn assert_sessions_bounded(events: &[NormalizedEvent], result: &AggregateResult) {
        for session in &result.sessions {
            let (Some(start), Some(end)) = (session.start, session.end) else {
                panic!("unbounded session {session:?} for {events:?}");
            };
            assert!(end >= start, "session ends before it starts: {session:?}");
        }
    }

    #[test]
    fn test_lone_logout_opens_and_closes_session() {
        let events = vec![logout(1, 0)];
        let result = aggregate(&events, Dimension::Module, &config());

        assert_eq!(result.sessions.len(), 1);
        assert_eq!(span(&result.sessions[0]), (0, 0, 0));
        assert_eq!(result.sessions[0].start_display, "2023-11-14 22:13:20");
        assert_eq!(result.sessions[0].duration_display, "0s");
    }

    #[test]
    fn test_logout_after_excluded_events_starts_at_stream_start() {
        let mut cfg = config();
        cfg.ignore_modules = vec!["forum".to_string()];
        let events = vec![view(1, 0, "forum", 21), logout(2, 100)];
        let result = aggregate(&events, Dimension::Module, &cfg);

        assert_eq!(span(&result.sessions[0]), (0, 100, 100));
    }

    #[test]
    fn test_login_closes_session_left_open_by_dropped_event() {
        let events = vec![
            view(1, 0, "page", 11),
            failed_system(2, 100),
            login(3, 200),
            view(4, 300, "page", 11),
        ];
        let result = aggregate(&events, Dimension::Module, &config());

        assert_eq!(result.sessions.len(), 2);
        assert_eq!(span(&result.sessions[0]), (0, 100, 100));
        assert_eq!(span(&result.sessions[1]), (200, 1200, 1000));
    }

    #[test]
    fn test_spillover_close_before_first_login_keeps_session_zero() {
        let mut cfg = config();
        cfg.ignore_modules = vec!["forum".to_string()];
        let events = vec![
            view(1, 0, "forum", 21),
            login(2, 100),
            view(3, 200, "page", 11),
        ];
        let result = aggregate(&events, Dimension::Module, &cfg);

        assert_eq!(result.sessions.len(), 2);
        assert_eq!(span(&result.sessions[0]), (0, 100, 100));
        assert_eq!(span(&result.sessions[1]), (100, 1100, 1000));
    }

    #[test]
    fn test_every_session_is_bounded() {
        let mut cfg = config();
        cfg.ignore_modules = vec!["forum".to_string()];
        let kinds = ["login", "loggedout", "page", "forum", "failed", "loggedin"];
        let gaps = [0, 60, 2000];

        for len in 1..=4u32 {
            let combos = (kinds.len() * gaps.len()).pow(len);
            for mut code in 0..combos {
                let mut events = Vec::new();
                let mut offset = 0;
                for id in 0..i64::from(len) {
                    let kind = kinds[code % kinds.len()];
                    code /= kinds.len();
                    offset += gaps[code % gaps.len()];
                    code /= gaps.len();
                    events.push(match kind {
                        "login" => login(id, offset),
                        "loggedout" => logout(id, offset),
                        "page" => view(id, offset, "page", 11),
                        "forum" => view(id, offset, "forum", 21),
                        "failed" => failed_system(id, offset),
                        _ => ev(id, offset, "user", 0, "loggedin"),
                    });
                }
                let result = aggregate(&events, Dimension::Module, &cfg);
                assert_sessions_bounded(&events, &result);
            }
        }
    }

    #[test]
    fn test_from_minutes_saturates() {
        let cfg = AggregationConfig::from_minutes(i64::MAX, 15);
        assert_eq!(cfg.threshold, i64::MAX);
        assert_eq!(cfg.last_ping_credit, 900);
    }

    #[test]
    fn test_user_dimension_buckets_by_user() {
        let events = vec![view(1, 0, "page", 11), view(2, 100, "quiz", 12)];
        let result = aggregate(&events, Dimension::User, &config());

        assert_eq!(result.bucket(&dim("2"), 11).unwrap().elapsed, 100);
        assert_eq!(result.bucket(&dim("2"), 12).unwrap().elapsed, 900);
        assert_eq!(elapsed(&result, &Category::CourseTotal, COURSE), 1000);
    }

    #[test]
    fn test_dimension_parses_from_name() {
        assert_eq!("course".parse::<Dimension>(), Ok(Dimension::Course));
        assert_eq!(Dimension::User.to_string(), "user");
        assert_eq!(
            "country".parse::<Dimension>().unwrap_err().to_string(),
            "unknown aggregation dimension: country"
        );
    }

    #[test]
    fn test_session_displays_are_filled() {
        let events = vec![login(1, 0), logout(2, 3661)];
        let cfg = AggregationConfig::from_minutes(120, 15);
        let result = aggregate(&events, Dimension::Module, &cfg);

        let session = &result.sessions[0];
        assert_eq!(session.start_display, "2023-11-14 22:13:20");
        assert_eq!(session.end_display, "2023-11-14 23:14:21");
        assert_eq!(session.duration_display, "1h 1m 1s");
        assert_eq!(
            result.bucket(&dim("user"), 0).unwrap().elapsed_display,
            "1h 1m 1s"
        );
    }
}
