//! Storage adapter (C2): the only module that speaks SQL.
//!
//! Schema (§6): `events` holds one row per stored event; `tags_index` and
//! `events_fts` are auxiliary indexes kept in sync with `events` by SQLite
//! triggers that call back into a registered scalar function
//! (`relay_fts_text`) rather than duplicating the tag-folding logic in SQL.
//! Callers never touch `tags_index`/`events_fts` directly.
use crate::error::{Error, Result};
use crate::event::{fts_text_from_tags_json, Event};
use crate::query::QueryPlan;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{functions::FunctionFlags, params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    pubkey TEXT NOT NULL,
    sig TEXT NOT NULL,
    kind INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    content TEXT NOT NULL,
    tags TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS events_pubkey_kind_idx ON events (pubkey, kind, created_at);
CREATE INDEX IF NOT EXISTS events_kind_idx ON events (kind);
CREATE INDEX IF NOT EXISTS events_created_at_idx ON events (created_at);

CREATE TABLE IF NOT EXISTS tags_index (
    fid INTEGER NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS tags_index_value_idx ON tags_index (value);
CREATE INDEX IF NOT EXISTS tags_index_fid_idx ON tags_index (fid);

CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(text, tokenize = 'trigram');

CREATE TRIGGER IF NOT EXISTS events_tags_ai AFTER INSERT ON events BEGIN
    INSERT INTO tags_index (fid, value)
    SELECT NEW.rowid, json_extract(tag.value, '$[0]') || ':' || json_extract(tag.value, '$[1]')
    FROM json_each(NEW.tags) AS tag
    WHERE json_array_length(tag.value) >= 2 AND length(json_extract(tag.value, '$[0]')) = 1;
END;

CREATE TRIGGER IF NOT EXISTS events_tags_ad AFTER DELETE ON events BEGIN
    DELETE FROM tags_index WHERE fid = OLD.rowid;
END;

CREATE TRIGGER IF NOT EXISTS events_fts_ai AFTER INSERT ON events BEGIN
    INSERT INTO events_fts (rowid, text) VALUES (NEW.rowid, relay_fts_text(NEW.tags));
END;

CREATE TRIGGER IF NOT EXISTS events_fts_ad AFTER DELETE ON events BEGIN
    DELETE FROM events_fts WHERE rowid = OLD.rowid;
END;
"#;

/// Outcome of [`Storage::insert`] (§4.5 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Map a raw `rusqlite` error onto the crate's storage error kinds (§4.2,
/// §7): busy/locked is retryable, corruption is fatal, everything else
/// passes through as-is.
fn map_err(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(ref ffi_err, _) = e {
        match ffi_err.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                return Error::StorageBusy;
            }
            rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                return Error::StorageCorrupt(e.to_string());
            }
            _ => {}
        }
    }
    Error::Sqlite(e)
}

fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "relay_fts_text",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let tags_json: String = ctx.get(0)?;
            Ok(fts_text_from_tags_json(&tags_json))
        },
    )
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let tags_json: String = row.get(4)?;
    let tags: Vec<Vec<String>> = serde_json::from_str(&tags_json).unwrap_or_default();
    Ok(Event {
        id: row.get(0)?,
        pubkey: row.get(1)?,
        created_at: row.get(2)?,
        kind: row.get(3)?,
        tags,
        content: row.get(5)?,
        sig: row.get(6)?,
    })
}

/// The storage adapter (C2). Wraps a pooled connection to a single SQLite
/// file; every public method maps to exactly the operations §4.2 specifies.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<SqliteConnectionManager>,
}

impl Storage {
    /// Open (creating if absent) the event database at `dir/nostr.db` and
    /// run schema bootstrap.
    pub fn open(dir: &Path) -> Result<Storage> {
        let path = dir.join("nostr.db");
        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
            register_functions(conn)
        });
        let pool = Pool::builder().max_size(8).build(manager).map_err(Error::Pool)?;
        let conn = pool.get().map_err(Error::Pool)?;
        conn.execute_batch(SCHEMA).map_err(map_err)?;
        info!("storage opened at {:?}", path);
        Ok(Storage { pool })
    }

    /// An in-memory store, for tests. A single-connection pool, since every
    /// `:memory:` connection is an independent database.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Storage> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            register_functions(conn)
        });
        let pool = Pool::builder().max_size(1).build(manager).map_err(Error::Pool)?;
        let conn = pool.get().map_err(Error::Pool)?;
        conn.execute_batch(SCHEMA).map_err(map_err)?;
        Ok(Storage { pool })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(Error::Pool)
    }

    /// `insert(event)` (§4.2). Populates `tags_index`/`events_fts` via the
    /// schema's triggers in the same statement; `Duplicate` when the id
    /// already exists (§3 invariant).
    pub fn insert(&self, event: &Event) -> Result<InsertOutcome> {
        let conn = self.conn()?;
        let changed = insert_event(&conn, event)?;
        Ok(if changed == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    /// `delete_by_id(id)` (§4.2).
    pub fn delete_by_id(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        Ok(delete_event(&conn, id)? > 0)
    }

    /// `exists(id) -> bool` (§4.2).
    pub fn exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        event_exists(&conn, id)
    }

    /// `query(compiled_plan) -> sequence<event>` (§4.2); streams results in
    /// the order the plan's `ORDER BY` requests.
    pub fn query(&self, plan: &QueryPlan) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        run_query(&conn, plan)
    }

    /// The current holder of a replaceable key `(pubkey, kind)` (§4.5),
    /// or `None`. Orders by `created_at DESC, id DESC` so that, per the
    /// documented tie-break decision (see DESIGN.md), an identical
    /// `created_at` resolves to the lexicographically larger id.
    pub fn current_replaceable_holder(&self, pubkey: &str, kind: u16) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id FROM events WHERE pubkey = ?1 AND kind = ?2 \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            params![pubkey, kind],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_err)
    }

    /// The current holder of a parameterizable-replaceable key
    /// `(pubkey, kind, d_tag)` (§4.5).
    pub fn current_param_replaceable_holder(
        &self,
        pubkey: &str,
        kind: u16,
        d_tag: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id FROM events e WHERE e.pubkey = ?1 AND e.kind = ?2 \
             AND EXISTS (SELECT 1 FROM tags_index ti WHERE ti.fid = e.rowid AND ti.value = ?3) \
             ORDER BY e.created_at DESC, e.id DESC LIMIT 1",
            params![pubkey, kind, format!("d:{d_tag}")],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_err)
    }

    /// Run `body` inside a single SQLite transaction, committing on `Ok`
    /// and rolling back (via `Drop`) on `Err`. The write path (§4.5) uses
    /// this so "insert new, delete predecessor" commits as one unit.
    pub fn write_transaction<T>(
        &self,
        body: impl FnOnce(&rusqlite::Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(map_err)?;
        let out = body(&tx)?;
        tx.commit().map_err(map_err)?;
        Ok(out)
    }
}

/// Insert one event, ignoring (reporting zero rows changed) if the id
/// already exists. Usable against either a plain `Connection` or an open
/// `Transaction`, both of which deref to `Connection`.
pub fn insert_event(conn: &Connection, event: &Event) -> Result<usize> {
    let tags_json = serde_json::to_string(&event.tags)?;
    conn.execute(
        "INSERT OR IGNORE INTO events (id, pubkey, sig, kind, created_at, content, tags) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.id,
            event.pubkey,
            event.sig,
            event.kind,
            event.created_at,
            event.content,
            tags_json
        ],
    )
    .map_err(map_err)
}

pub fn delete_event(conn: &Connection, id: &str) -> Result<usize> {
    conn.execute("DELETE FROM events WHERE id = ?1", params![id]).map_err(map_err)
}

pub fn event_exists(conn: &Connection, id: &str) -> Result<bool> {
    conn.query_row("SELECT 1 FROM events WHERE id = ?1", params![id], |_| Ok(()))
        .optional()
        .map(|r| r.is_some())
        .map_err(map_err)
}

pub fn run_query(conn: &Connection, plan: &QueryPlan) -> Result<Vec<Event>> {
    debug!(sql = %plan.sql, "running compiled query");
    let mut stmt = conn.prepare(&plan.sql).map_err(map_err)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = plan.params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), row_to_event)
        .map_err(map_err)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(map_err)?);
    }
    Ok(out)
}
