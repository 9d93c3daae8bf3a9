//! Collaborators the aggregation pipeline reads from, and the pipeline itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{AggregationConfig, Dimension, aggregate};
use crate::event::{Event, EventSchema};
use crate::gaps::{GapDimensions, GapEvent, SiteAggregate, aggregate_gaps};
use crate::normalize::{ModuleResolver, normalize_all};
use crate::overlay::{
    CreditInstance, OverlayPolicy, RecordedTimes, SCORM_MODULE, TimeRecord, apply_overlay,
    apply_recorded_time,
};
use crate::result::{AggregateResult, Category};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by collaborators during a pipeline run.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to fetch events: {0}")]
    Events(#[source] BoxError),
    #[error("failed to read time credits: {0}")]
    Credits(#[source] BoxError),
    #[error("failed to read recorded times: {0}")]
    Recorded(#[source] BoxError),
}

/// Window and filters for an event fetch.
///
/// Both bounds are exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    pub from: i64,
    pub to: i64,
    /// Empty means every user.
    #[serde(default)]
    pub users: Vec<i64>,
    /// Empty means every course.
    #[serde(default)]
    pub courses: Vec<i64>,
}

/// Supplies time-ordered log events.
pub trait EventSource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The log model events are read from, or `None` when no log is
    /// available.
    fn schema(&self) -> Option<EventSchema>;

    /// Fetches events strictly ordered by time ascending.
    fn fetch(&self, query: &EventQuery) -> Result<Vec<Event>, Self::Error>;
}

/// Supplies events paired with their precomputed gap.
pub trait GapSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn fetch_gaps(&self, query: &EventQuery) -> Result<Vec<GapEvent>, Self::Error>;
}

/// Read side of the time credit subsystem.
pub trait CreditTimeProvider {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Credit-enabled instances in a course.
    fn credit_instances(&self, course_id: i64) -> Result<Vec<CreditInstance>, Self::Error>;

    /// Credited times for a user. A non-zero `filter_cmid` narrows the
    /// result to one course module.
    fn credit_times(
        &self,
        instance_id: i64,
        filter_cmid: i64,
        user_id: i64,
    ) -> Result<Vec<TimeRecord>, Self::Error>;

    /// Self-declared times for a user, filtered like [`Self::credit_times`].
    fn declared_times(
        &self,
        instance_id: i64,
        filter_cmid: i64,
        user_id: i64,
    ) -> Result<Vec<TimeRecord>, Self::Error>;
}

/// Supplies total times recorded by self-timed activities.
pub trait RecordedTimeProvider {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Recorded values for a course module and user within `[from, to]`,
    /// or `None` when the course module does not exist.
    fn recorded_times(
        &self,
        cmid: i64,
        user_id: i64,
        from: i64,
        to: i64,
    ) -> Result<Option<RecordedTimes>, Self::Error>;
}

/// One user's aggregation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuery {
    pub user_id: i64,
    /// Course whose credit instances are consulted; 0 skips the overlay.
    #[serde(default)]
    pub course_id: i64,
    pub from: i64,
    pub to: i64,
    /// Field the first-level buckets are grouped by.
    #[serde(default)]
    pub dimension: Dimension,
}

impl UserQuery {
    fn events(&self) -> EventQuery {
        EventQuery {
            from: self.from,
            to: self.to,
            users: vec![self.user_id],
            courses: if self.course_id == 0 {
                Vec::new()
            } else {
                vec![self.course_id]
            },
        }
    }
}

/// Runs fetch, normalization, aggregation and the overlays for one user.
pub fn compute_user_stats<S>(
    store: &S,
    query: &UserQuery,
    config: &AggregationConfig,
    policy: OverlayPolicy,
) -> Result<AggregateResult, StatsError>
where
    S: EventSource + ModuleResolver + CreditTimeProvider + RecordedTimeProvider,
{
    let Some(schema) = store.schema() else {
        tracing::warn!("no log reader available");
        return Ok(AggregateResult::default());
    };

    let events = EventSource::fetch(store, &query.events())
        .map_err(|e| StatsError::Events(Box::new(e)))?;
    tracing::debug!(
        user = query.user_id,
        count = events.len(),
        course_field = schema.course_field(),
        "fetched events"
    );
    let mut result = aggregate_events(&events, schema, store, query.dimension, config);

    if query.course_id != 0 {
        let (credits, declared) = collect_overrides(store, query.course_id, query.user_id)
            .map_err(|e| StatsError::Credits(Box::new(e)))?;
        apply_overlay(&mut result, &credits, &declared, policy);
    }

    apply_recorded_times(store, &mut result, query)
        .map_err(|e| StatsError::Recorded(Box::new(e)))?;
    result.refresh_display();
    Ok(result)
}

/// Normalizes (when the schema requires it) and aggregates along `dimension`.
pub fn aggregate_events<R: ModuleResolver + ?Sized>(
    events: &[Event],
    schema: EventSchema,
    resolver: &R,
    dimension: Dimension,
    config: &AggregationConfig,
) -> AggregateResult {
    let normalized = normalize_all(events, schema, resolver);
    aggregate(&normalized, dimension, config)
}

/// Gathers credited and declared times across a course's instances.
fn collect_overrides<C: CreditTimeProvider + ?Sized>(
    provider: &C,
    course_id: i64,
    user_id: i64,
) -> Result<(Vec<TimeRecord>, Vec<TimeRecord>), C::Error> {
    let mut credits = Vec::new();
    let mut declared = Vec::new();
    for instance in provider.credit_instances(course_id)? {
        credits.extend(
            provider
                .credit_times(instance.id, 0, user_id)?
                .into_iter()
                .map(|r| r.resolved(&instance)),
        );
        declared.extend(
            provider
                .declared_times(instance.id, 0, user_id)?
                .into_iter()
                .map(|r| r.resolved(&instance)),
        );
    }
    Ok((credits, declared))
}

fn apply_recorded_times<T: RecordedTimeProvider + ?Sized>(
    provider: &T,
    result: &mut AggregateResult,
    query: &UserQuery,
) -> Result<(), T::Error> {
    let category = Category::Dimension(SCORM_MODULE.to_string());
    let cmids: Vec<i64> = result
        .category(&category)
        .map(|buckets| buckets.keys().copied().collect())
        .unwrap_or_default();

    for cmid in cmids {
        let recorded = provider.recorded_times(cmid, query.user_id, query.from, query.to)?;
        if let Some(recorded) = recorded {
            apply_recorded_time(result, cmid, &recorded);
        }
    }
    Ok(())
}

/// Runs the site gap aggregation. A missing gap log yields empty totals.
pub fn compute_site_stats<G: GapSource + ?Sized>(
    source: Option<&G>,
    query: &EventQuery,
    dimensions: GapDimensions,
    config: &AggregationConfig,
) -> Result<SiteAggregate, StatsError> {
    let Some(source) = source else {
        return Ok(SiteAggregate::default());
    };
    let events = source
        .fetch_gaps(query)
        .map_err(|e| StatsError::Events(Box::new(e)))?;
    Ok(aggregate_gaps(&events, dimensions, config))
}
