//! Log events as delivered by an event source.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An interaction action recorded in the log.
///
/// The handful of actions the session automaton reacts to are named; every
/// other action is carried through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    /// Legacy log login, and the canonical form of a system-level `loggedin`.
    Login,
    /// Standard log login as recorded.
    LoggedIn,
    LoggedOut,
    Failed,
    Graded,
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Login => "login",
            Self::LoggedIn => "loggedin",
            Self::LoggedOut => "loggedout",
            Self::Failed => "failed",
            Self::Graded => "graded",
            Self::Other(action) => action,
        }
    }

    /// Returns true for either login spelling.
    pub const fn starts_session(&self) -> bool {
        matches!(self, Self::Login | Self::LoggedIn)
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        match s {
            "login" => Self::Login,
            "loggedin" => Self::LoggedIn,
            "loggedout" => Self::LoggedOut,
            "failed" => Self::Failed,
            "graded" => Self::Graded,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Action {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// Scope the event was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextLevel {
    System,
    User,
    CourseCategory,
    Course,
    Module,
    Block,
}

impl ContextLevel {
    /// Numeric level as stored by the standard log.
    pub const fn code(self) -> i64 {
        match self {
            Self::System => 10,
            Self::User => 30,
            Self::CourseCategory => 40,
            Self::Course => 50,
            Self::Module => 70,
            Self::Block => 80,
        }
    }

    /// Maps a stored level code. Unknown codes yield `None`.
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            10 => Some(Self::System),
            30 => Some(Self::User),
            40 => Some(Self::CourseCategory),
            50 => Some(Self::Course),
            70 => Some(Self::Module),
            80 => Some(Self::Block),
            _ => None,
        }
    }
}

/// Which log model a source reads from.
///
/// Declared once by the source so that the rest of the pipeline sees a
/// uniform event shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSchema {
    /// Context-based log; module and cmid must be derived from the context.
    #[default]
    Standard,
    /// Flat log carrying its own module and cmid columns.
    Legacy,
}

impl EventSchema {
    /// Name of the course column in this log model.
    pub const fn course_field(self) -> &'static str {
        match self {
            Self::Standard => "courseid",
            Self::Legacy => "course",
        }
    }

    pub const fn needs_normalization(self) -> bool {
        matches!(self, Self::Standard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event schema: {0}")]
pub struct UnknownSchema(String);

impl FromStr for EventSchema {
    type Err = UnknownSchema;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "legacy" => Ok(Self::Legacy),
            _ => Err(UnknownSchema(s.to_string())),
        }
    }
}

/// One timestamped interaction record, as fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    /// Seconds since the Unix epoch.
    pub time: i64,
    pub user_id: i64,
    pub course_id: i64,
    /// Module name, only present on legacy rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Course module id, 0 when none (legacy rows only).
    #[serde(default)]
    pub cmid: i64,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub context_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_level: Option<ContextLevel>,
}

/// An event with its dimension key resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedEvent {
    pub id: i64,
    pub time: i64,
    pub user_id: i64,
    pub course_id: i64,
    /// Module name or one of the pseudo dimensions (`system`, `course`,
    /// `user`). `None` when it could not be resolved.
    pub module: Option<String>,
    pub cmid: i64,
    pub action: Action,
    pub target: Option<String>,
}
