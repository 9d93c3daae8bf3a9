//! Core domain logic for activity usage statistics.
//!
//! This crate contains:
//! - Normalization: mapping log contexts onto module/cmid/action
//! - Aggregation: inferring sessions and per-dimension time from a log stream
//! - Overlay: merging credited, declared and self-recorded times
//! - Site gaps: site-wide totals from precomputed inter-event gaps

mod aggregate;
pub mod event;
pub mod format;
pub mod gaps;
pub mod normalize;
pub mod overlay;
pub mod result;
pub mod source;

pub use aggregate::{AggregationConfig, Dimension, UnknownDimension, aggregate};
pub use event::{Action, ContextLevel, Event, EventSchema, NormalizedEvent};
pub use format::{format_time, format_timestamp};
pub use gaps::{GapDimensions, GapEvent, HitBucket, SiteAggregate, aggregate_gaps};
pub use normalize::{ModuleResolver, NoResolver, normalize, normalize_all};
pub use overlay::{
    CreditInstance, MergePolicy, OverlayPolicy, RecordedTimes, TimeRecord, apply_overlay,
};
pub use result::{AggregateResult, Category, DimensionBucket, Diagnostic, Session, TimeSource};
pub use source::{
    CreditTimeProvider, EventQuery, EventSource, GapSource, RecordedTimeProvider, StatsError,
    UserQuery, aggregate_events, compute_site_stats, compute_user_stats,
};
