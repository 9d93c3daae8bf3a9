//! Maps standard-log context information onto a module/cmid/action triple.
//!
//! Legacy rows already carry their module and cmid and pass through as-is.

use crate::event::{Action, ContextLevel, Event, EventSchema, NormalizedEvent};

/// Dimension key used for system-level events.
pub const SYSTEM_DIMENSION: &str = "system";
/// Dimension key used for course-level (and any unclassified) events.
pub const COURSE_DIMENSION: &str = "course";
/// Dimension key used for user-level events and logins.
pub const USER_DIMENSION: &str = "user";
/// Placeholder used when a module name cannot be resolved.
pub const UNDEFINED_DIMENSION: &str = "undefined";

/// Lookups needed to turn a module context into a module name.
///
/// Each step may fail independently; failures are not errors; the
/// normalizer degrades to cmid 0 or an unresolved module.
pub trait ModuleResolver {
    /// Context id to the course module id it is attached to.
    fn context_instance(&self, context_id: i64) -> Option<i64>;

    /// Course module id to the module (activity type) id.
    fn module_of(&self, cmid: i64) -> Option<i64>;

    /// Module id to its name (e.g. `forum`, `quiz`).
    fn module_name(&self, module_id: i64) -> Option<String>;
}

/// A resolver that never resolves anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResolver;

impl ModuleResolver for NoResolver {
    fn context_instance(&self, _context_id: i64) -> Option<i64> {
        None
    }

    fn module_of(&self, _cmid: i64) -> Option<i64> {
        None
    }

    fn module_name(&self, _module_id: i64) -> Option<String> {
        None
    }
}

/// Normalizes one event according to the schema it was read with.
pub fn normalize<R: ModuleResolver + ?Sized>(
    event: &Event,
    schema: EventSchema,
    resolver: &R,
) -> NormalizedEvent {
    let mut normalized = NormalizedEvent {
        id: event.id,
        time: event.time,
        user_id: event.user_id,
        course_id: event.course_id,
        module: event.module.clone(),
        cmid: event.cmid,
        action: event.action.clone(),
        target: event.target.clone(),
    };

    if !schema.needs_normalization() {
        return normalized;
    }

    normalized.cmid = 0;
    match event.context_level {
        Some(ContextLevel::System) => {
            if event.action == Action::LoggedIn {
                normalized.module = Some(USER_DIMENSION.to_string());
                normalized.action = Action::Login;
            } else {
                normalized.module = Some(SYSTEM_DIMENSION.to_string());
            }
        }
        Some(ContextLevel::User) => {
            normalized.module = Some(USER_DIMENSION.to_string());
        }
        Some(ContextLevel::Module) => {
            let cmid = resolver.context_instance(event.context_id);
            normalized.module = cmid
                .and_then(|cmid| resolver.module_of(cmid))
                .and_then(|module_id| resolver.module_name(module_id));
            normalized.cmid = cmid.unwrap_or(0);
            if normalized.module.is_none() {
                tracing::warn!(
                    event_id = event.id,
                    context_id = event.context_id,
                    "could not resolve module for context"
                );
            }
        }
        _ => {
            normalized.module = Some(COURSE_DIMENSION.to_string());
        }
    }
    normalized
}

/// Normalizes a whole batch, preserving order.
pub fn normalize_all<R: ModuleResolver + ?Sized>(
    events: &[Event],
    schema: EventSchema,
    resolver: &R,
) -> Vec<NormalizedEvent> {
    events
        .iter()
        .map(|event| normalize(event, schema, resolver))
        .collect()
}
