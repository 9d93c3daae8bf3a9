//! Storage layer for usage statistics.
//!
//! Reads activity logs, module lookups, time credits and recorded times from
//! SQLite using `rusqlite`, and implements the collaborator traits of
//! [`us_core`] on top of them.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! Parallel callers should open one `Database` per thread.
//!
//! # Schema
//!
//! Times are stored as INTEGER seconds since the Unix epoch.
//!
//! Two log tables coexist:
//! - `log_standard`: context based rows (`context_id`, `context_level`) that
//!   need normalization before aggregation
//! - `log_legacy`: flat rows carrying their own `module` and `cmid`
//!
//! Which one is read is chosen per [`Database`] with [`Database::with_reader`].

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use thiserror::Error;
use us_core::{
    Action, ContextLevel, CreditInstance, CreditTimeProvider, Event, EventQuery, EventSchema,
    EventSource, GapEvent, GapSource, ModuleResolver, RecordedTimeProvider, RecordedTimes,
    TimeRecord,
};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A filter list too long to bind as statement parameters.
    #[error("too many {what} in filter: {count}")]
    FilterTooLarge { what: &'static str, count: usize },
}

/// Bound parameters SQLite accepts per statement, with room for the fixed ones.
const MAX_FILTER_IDS: usize = 30_000;

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
    reader: Option<EventSchema>,
}

/// A context-based log row ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub id: i64,
    pub time: i64,
    pub user_id: i64,
    pub course_id: i64,
    pub action: String,
    pub target: Option<String>,
    pub context_id: i64,
    pub context_level: i64,
    /// `web`, `cli`, `ws`...; `cli` rows are never read back.
    pub origin: String,
    /// Set when an administrator acted on behalf of the user.
    pub real_user_id: Option<i64>,
}

/// A flat legacy log row ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyLogRecord {
    pub id: i64,
    pub time: i64,
    pub user_id: i64,
    pub course_id: i64,
    pub module: String,
    pub cmid: i64,
    pub action: String,
}

/// Which override channel a stored time record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKind {
    Credit,
    Declared,
}

impl TimeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Declared => "declared",
        }
    }
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The schema is initialized on open and the standard log is read by default.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn,
            reader: Some(EventSchema::Standard),
        };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            reader: Some(EventSchema::Standard),
        };
        db.init()?;
        Ok(db)
    }

    /// Selects the log table events are read from. `None` disables event reads.
    #[must_use]
    pub const fn with_reader(mut self, reader: Option<EventSchema>) -> Self {
        self.reader = reader;
        self
    }

    pub const fn reader(&self) -> Option<EventSchema> {
        self.reader
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS log_standard (
                id INTEGER PRIMARY KEY,
                time INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                course_id INTEGER NOT NULL DEFAULT 0,
                action TEXT NOT NULL,
                target TEXT,
                context_id INTEGER NOT NULL DEFAULT 0,
                context_level INTEGER NOT NULL DEFAULT 0,
                origin TEXT NOT NULL DEFAULT 'web',
                real_user_id INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_log_standard_user_time ON log_standard(user_id, time);
            CREATE INDEX IF NOT EXISTS idx_log_standard_course ON log_standard(course_id);

            CREATE TABLE IF NOT EXISTS log_legacy (
                id INTEGER PRIMARY KEY,
                time INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                course INTEGER NOT NULL DEFAULT 0,
                module TEXT NOT NULL,
                cmid INTEGER NOT NULL DEFAULT 0,
                action TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_log_legacy_user_time ON log_legacy(user_id, time);
            CREATE INDEX IF NOT EXISTS idx_log_legacy_course ON log_legacy(course);

            -- Lookup chain for module contexts: context -> course module -> module
            CREATE TABLE IF NOT EXISTS contexts (
                id INTEGER PRIMARY KEY,
                level INTEGER NOT NULL,
                instance_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS course_modules (
                id INTEGER PRIMARY KEY,
                course_id INTEGER NOT NULL,
                module_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS modules (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                institution TEXT NOT NULL DEFAULT ''
            );

            -- Precomputed seconds from a log row to the same user's next row
            CREATE TABLE IF NOT EXISTS log_gaps (
                log_id INTEGER PRIMARY KEY,
                gap INTEGER
            );

            CREATE TABLE IF NOT EXISTS credit_instances (
                id INTEGER PRIMARY KEY,
                course_id INTEGER NOT NULL,
                cmid INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1
            );

            -- kind: 'credit' or 'declared'; cmid 0 credits the instance itself
            CREATE TABLE IF NOT EXISTS time_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id INTEGER NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('credit', 'declared')),
                user_id INTEGER NOT NULL,
                modname TEXT NOT NULL,
                cmid INTEGER NOT NULL DEFAULT 0,
                seconds INTEGER NOT NULL,
                FOREIGN KEY (instance_id) REFERENCES credit_instances(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_time_records_lookup
                ON time_records(instance_id, kind, user_id);

            -- Total times reported by self-timed activities, as HH:MM:SS.cc
            CREATE TABLE IF NOT EXISTS recorded_times (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cmid INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                value TEXT NOT NULL,
                time_modified INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_recorded_times_lookup ON recorded_times(cmid, user_id);
            ",
        )?;
        Ok(())
    }

    /// Inserts standard log rows, ignoring duplicates by ID.
    pub fn insert_log_records(&mut self, records: &[LogRecord]) -> Result<usize, DbError> {
        if records.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR IGNORE INTO log_standard
                (id, time, user_id, course_id, action, target, context_id, context_level,
                 origin, real_user_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for record in records {
                inserted += stmt.execute(params![
                    record.id,
                    record.time,
                    record.user_id,
                    record.course_id,
                    record.action,
                    record.target,
                    record.context_id,
                    record.context_level,
                    record.origin,
                    record.real_user_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Inserts legacy log rows, ignoring duplicates by ID.
    pub fn insert_legacy_records(
        &mut self,
        records: &[LegacyLogRecord],
    ) -> Result<usize, DbError> {
        if records.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR IGNORE INTO log_legacy (id, time, user_id, course, module, cmid, action)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for record in records {
                inserted += stmt.execute(params![
                    record.id,
                    record.time,
                    record.user_id,
                    record.course_id,
                    record.module,
                    record.cmid,
                    record.action,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Registers a course module of the named module type, with its module
    /// context. Returns the module id.
    pub fn add_course_module(
        &mut self,
        cmid: i64,
        course_id: i64,
        module_name: &str,
        context_id: i64,
    ) -> Result<i64, DbError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO modules (name) VALUES (?)",
            [module_name],
        )?;
        let module_id: i64 = tx.query_row(
            "SELECT id FROM modules WHERE name = ?",
            [module_name],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO course_modules (id, course_id, module_id) VALUES (?, ?, ?)",
            params![cmid, course_id, module_id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO contexts (id, level, instance_id) VALUES (?, ?, ?)",
            params![context_id, ContextLevel::Module.code(), cmid],
        )?;
        tx.commit()?;
        Ok(module_id)
    }

    /// Creates or updates a user's institution.
    pub fn upsert_user(&mut self, user_id: i64, institution: &str) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO users (id, institution) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET institution = excluded.institution
            ",
            params![user_id, institution],
        )?;
        Ok(())
    }

    /// Stores precomputed gaps keyed by log row ID.
    pub fn insert_gaps(&mut self, gaps: &[(i64, Option<i64>)]) -> Result<usize, DbError> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO log_gaps (log_id, gap) VALUES (?, ?)")?;
            for (log_id, gap) in gaps {
                inserted += stmt.execute(params![log_id, gap])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Registers a credit-enabled instance in a course.
    pub fn add_credit_instance(
        &mut self,
        instance: &CreditInstance,
        course_id: i64,
        enabled: bool,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT OR REPLACE INTO credit_instances (id, course_id, cmid, enabled)
            VALUES (?, ?, ?, ?)
            ",
            params![instance.id, course_id, instance.cmid, enabled],
        )?;
        Ok(())
    }

    /// Stores credited or declared times for a user.
    pub fn insert_time_records(
        &mut self,
        instance_id: i64,
        kind: TimeKind,
        user_id: i64,
        records: &[TimeRecord],
    ) -> Result<usize, DbError> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO time_records (instance_id, kind, user_id, modname, cmid, seconds)
                VALUES (?, ?, ?, ?, ?, ?)
                ",
            )?;
            for record in records {
                inserted += stmt.execute(params![
                    instance_id,
                    kind.as_str(),
                    user_id,
                    record.modname,
                    record.cmid,
                    record.seconds,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Stores a total time reported by a self-timed activity.
    pub fn insert_recorded_time(
        &mut self,
        cmid: i64,
        user_id: i64,
        value: &str,
        time_modified: i64,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO recorded_times (cmid, user_id, value, time_modified) VALUES (?, ?, ?, ?)",
            params![cmid, user_id, value, time_modified],
        )?;
        Ok(())
    }

    /// Lists users having at least one readable log row in the window.
    pub fn list_active_users(&self, query: &EventQuery) -> Result<Vec<i64>, DbError> {
        let Some(schema) = self.reader else {
            return Ok(Vec::new());
        };
        let filter = LogFilter::build(schema, query)?;
        let sql = format!(
            "SELECT DISTINCT user_id FROM {} WHERE {} ORDER BY user_id ASC",
            filter.table, filter.clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(filter.params.iter()), |row| row.get(0))?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    fn fetch_events(&self, schema: EventSchema, query: &EventQuery) -> Result<Vec<Event>, DbError> {
        if query.to <= query.from {
            return Ok(Vec::new());
        }
        let filter = LogFilter::build(schema, query)?;
        let columns = match schema {
            EventSchema::Standard => {
                "id, time, user_id, course_id, action, target, context_id, context_level, \
                 NULL, 0"
            }
            EventSchema::Legacy => "id, time, user_id, course, action, NULL, 0, NULL, module, cmid",
        };
        let sql = format!(
            "SELECT {columns} FROM {} WHERE {} ORDER BY time ASC, id ASC",
            filter.table, filter.clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(filter.params.iter()), |row| {
            let action: String = row.get(4)?;
            let level: Option<i64> = row.get(7)?;
            Ok(Event {
                id: row.get(0)?,
                time: row.get(1)?,
                user_id: row.get(2)?,
                course_id: row.get(3)?,
                action: Action::from(action.as_str()),
                target: row.get(5)?,
                context_id: row.get(6)?,
                context_level: level.and_then(ContextLevel::from_code),
                module: row.get(8)?,
                cmid: row.get(9)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    fn fetch_time_records(
        &self,
        instance_id: i64,
        kind: TimeKind,
        filter_cmid: i64,
        user_id: i64,
    ) -> Result<Vec<TimeRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT modname, cmid, seconds
            FROM time_records
            WHERE instance_id = ?1 AND kind = ?2 AND user_id = ?3
              AND (?4 = 0 OR cmid = ?4)
            ORDER BY id ASC
            ",
        )?;
        let rows = stmt.query_map(
            params![instance_id, kind.as_str(), user_id, filter_cmid],
            |row| {
                Ok(TimeRecord {
                    modname: row.get(0)?,
                    cmid: row.get(1)?,
                    seconds: row.get(2)?,
                })
            },
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn lookup(&self, sql: &str, key: i64) -> Option<i64> {
        self.conn
            .query_row(sql, [key], |row| row.get(0))
            .optional()
            .unwrap_or_else(|err| {
                tracing::warn!(key, error = %err, "module lookup failed");
                None
            })
    }
}

/// WHERE clause and bound values selecting readable log rows.
struct LogFilter {
    table: &'static str,
    clause: String,
    params: Vec<i64>,
}

impl LogFilter {
    /// Rows strictly inside the window, for the given users, either in the
    /// given courses or being a login on the site course (0 in the standard
    /// log, 1 in the legacy one).
    fn build(schema: EventSchema, query: &EventQuery) -> Result<Self, DbError> {
        for (what, ids) in [("users", &query.users), ("courses", &query.courses)] {
            if ids.len() > MAX_FILTER_IDS {
                return Err(DbError::FilterTooLarge {
                    what,
                    count: ids.len(),
                });
            }
        }

        let (table, course, site, login, mut clause) = match schema {
            EventSchema::Standard => (
                "log_standard",
                "course_id",
                0,
                "loggedin",
                String::from("origin != 'cli' AND real_user_id IS NULL AND "),
            ),
            EventSchema::Legacy => ("log_legacy", "course", 1, "login", String::new()),
        };
        clause.push_str("time > ? AND time < ?");
        let mut params = vec![query.from, query.to];

        if !query.users.is_empty() {
            clause.push_str(&format!(" AND user_id IN ({})", placeholders(query.users.len())));
            params.extend(&query.users);
        }
        if !query.courses.is_empty() {
            clause.push_str(&format!(
                " AND (({course} = {site} AND action = '{login}') OR {course} IN ({}))",
                placeholders(query.courses.len())
            ));
            params.extend(&query.courses);
        }

        Ok(Self {
            table,
            clause,
            params,
        })
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

impl EventSource for Database {
    type Error = DbError;

    fn schema(&self) -> Option<EventSchema> {
        self.reader
    }

    fn fetch(&self, query: &EventQuery) -> Result<Vec<Event>, Self::Error> {
        match self.reader {
            Some(schema) => self.fetch_events(schema, query),
            None => Ok(Vec::new()),
        }
    }
}

impl ModuleResolver for Database {
    fn context_instance(&self, context_id: i64) -> Option<i64> {
        self.lookup("SELECT instance_id FROM contexts WHERE id = ?", context_id)
    }

    fn module_of(&self, cmid: i64) -> Option<i64> {
        self.lookup("SELECT module_id FROM course_modules WHERE id = ?", cmid)
    }

    fn module_name(&self, module_id: i64) -> Option<String> {
        self.conn
            .query_row("SELECT name FROM modules WHERE id = ?", [module_id], |row| {
                row.get(0)
            })
            .optional()
            .unwrap_or_else(|err| {
                tracing::warn!(module_id, error = %err, "module name lookup failed");
                None
            })
    }
}

impl CreditTimeProvider for Database {
    type Error = DbError;

    fn credit_instances(&self, course_id: i64) -> Result<Vec<CreditInstance>, Self::Error> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, cmid
            FROM credit_instances
            WHERE course_id = ? AND enabled = 1
            ORDER BY id ASC
            ",
        )?;
        let rows = stmt.query_map([course_id], |row| {
            Ok(CreditInstance {
                id: row.get(0)?,
                cmid: row.get(1)?,
            })
        })?;
        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?);
        }
        Ok(instances)
    }

    fn credit_times(
        &self,
        instance_id: i64,
        filter_cmid: i64,
        user_id: i64,
    ) -> Result<Vec<TimeRecord>, Self::Error> {
        self.fetch_time_records(instance_id, TimeKind::Credit, filter_cmid, user_id)
    }

    fn declared_times(
        &self,
        instance_id: i64,
        filter_cmid: i64,
        user_id: i64,
    ) -> Result<Vec<TimeRecord>, Self::Error> {
        self.fetch_time_records(instance_id, TimeKind::Declared, filter_cmid, user_id)
    }
}

impl RecordedTimeProvider for Database {
    type Error = DbError;

    fn recorded_times(
        &self,
        cmid: i64,
        user_id: i64,
        from: i64,
        to: i64,
    ) -> Result<Option<RecordedTimes>, Self::Error> {
        let course_id: Option<i64> = self
            .conn
            .query_row(
                "SELECT course_id FROM course_modules WHERE id = ?",
                [cmid],
                |row| row.get(0),
            )
            .optional()?;
        let Some(course_id) = course_id else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "
            SELECT value
            FROM recorded_times
            WHERE cmid = ?1 AND user_id = ?2
              AND (?3 = 0 OR time_modified >= ?3)
              AND (?4 = 0 OR time_modified <= ?4)
            ORDER BY id ASC
            ",
        )?;
        let rows = stmt.query_map(params![cmid, user_id, from, to], |row| row.get(0))?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(Some(RecordedTimes { course_id, values }))
    }
}

impl GapSource for Database {
    type Error = DbError;

    /// Rows inside the inclusive window joined with their gap and the user's
    /// institution.
    fn fetch_gaps(&self, query: &EventQuery) -> Result<Vec<GapEvent>, Self::Error> {
        let (table, course) = match self.reader.unwrap_or_default() {
            EventSchema::Standard => ("log_standard", "course_id"),
            EventSchema::Legacy => ("log_legacy", "course"),
        };
        let mut clause = String::from("l.time >= ? AND l.time <= ?");
        let mut params = vec![query.from, query.to];
        for (column, ids) in [("user_id", &query.users), (course, &query.courses)] {
            if ids.len() > MAX_FILTER_IDS {
                return Err(DbError::FilterTooLarge {
                    what: if column == "user_id" { "users" } else { "courses" },
                    count: ids.len(),
                });
            }
            if !ids.is_empty() {
                clause.push_str(&format!(" AND l.{column} IN ({})", placeholders(ids.len())));
                params.extend(ids.iter());
            }
        }

        let sql = format!(
            "
            SELECT l.id, l.time, l.user_id, l.{course}, g.gap, COALESCE(u.institution, '')
            FROM {table} l
            LEFT JOIN log_gaps g ON g.log_id = l.id
            LEFT JOIN users u ON u.id = l.user_id
            WHERE {clause}
            ORDER BY l.time ASC, l.id ASC
            "
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok(GapEvent {
                id: row.get(0)?,
                time: row.get(1)?,
                user_id: row.get(2)?,
                course_id: row.get(3)?,
                gap: row.get(4)?,
                institution: row.get(5)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}
