use crate::{Datum, Record, RecordStore, StoreError, SubjectMatch, DEFAULT_BATCH_LIMIT};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use study_core::canonical_json;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "BEGIN;
    CREATE TABLE IF NOT EXISTS records(
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        user_defined TEXT NOT NULL DEFAULT 'null'
    );
    CREATE TABLE IF NOT EXISTS scalar_data(
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY(id, name)
    );
    CREATE INDEX IF NOT EXISTS scalar_data_name_value ON scalar_data(name, value);
    CREATE TABLE IF NOT EXISTS list_data(
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        idx INTEGER NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY(id, name, idx)
    );
    CREATE TABLE IF NOT EXISTS relationships(
        subject_id TEXT NOT NULL,
        predicate TEXT NOT NULL,
        object_id TEXT NOT NULL,
        PRIMARY KEY(subject_id, predicate, object_id)
    );
    COMMIT;";

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// SQLite-backed record store. Each instance owns one connection.
pub struct SqliteRecordStore {
    location: Location,
    label: String,
    batch_limit: usize,
    conn: Option<Connection>,
}

impl SqliteRecordStore {
    /// Opens (creating if needed) a database file and connects.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut store = Self {
            label: format!("sqlite://{}", path.display()),
            location: Location::File(path.to_path_buf()),
            batch_limit: DEFAULT_BATCH_LIMIT,
            conn: None,
        };
        store.connect()?;
        Ok(store)
    }

    /// A private in-memory database; its contents do not survive `disconnect`.
    pub fn in_memory() -> Result<Self, StoreError> {
        let mut store = Self {
            label: "sqlite://:memory:".to_string(),
            location: Location::Memory,
            batch_limit: DEFAULT_BATCH_LIMIT,
            conn: None,
        };
        store.connect()?;
        Ok(store)
    }

    /// Accepts `sqlite://<path>` or a bare path.
    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        let raw = url.strip_prefix("sqlite://").unwrap_or(url);
        if raw == ":memory:" {
            return Self::in_memory();
        }
        Self::open(Path::new(raw))
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// A second, independent connection to the same file.
    pub fn reopen(&self) -> Result<Self, StoreError> {
        match &self.location {
            Location::File(path) => Ok(Self::open(path)?.with_batch_limit(self.batch_limit)),
            Location::Memory => Err(StoreError::NotConnected(
                "in-memory stores cannot be shared across connections".to_string(),
            )),
        }
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn
            .as_ref()
            .ok_or_else(|| StoreError::NotConnected(self.label.clone()))
    }

    fn conn_mut(&mut self) -> Result<&mut Connection, StoreError> {
        let label = self.label.clone();
        self.conn.as_mut().ok_or(StoreError::NotConnected(label))
    }
}

fn encode(value: &Value) -> String {
    canonical_json(value)
}

fn decode(raw: &str) -> Result<Value, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn write_data(tx: &rusqlite::Transaction<'_>, record: &Record) -> Result<(), StoreError> {
    for (name, datum) in &record.data {
        tx.execute(
            "DELETE FROM scalar_data WHERE id = ?1 AND name = ?2",
            params![record.id, name],
        )?;
        tx.execute(
            "DELETE FROM list_data WHERE id = ?1 AND name = ?2",
            params![record.id, name],
        )?;
        match datum {
            Datum::Scalar(value) => {
                tx.execute(
                    "INSERT INTO scalar_data(id, name, value) VALUES (?1, ?2, ?3)",
                    params![record.id, name, encode(value)],
                )?;
            }
            Datum::List(items) => {
                for (idx, value) in items.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO list_data(id, name, idx, value) VALUES (?1, ?2, ?3, ?4)",
                        params![record.id, name, idx as i64, encode(value)],
                    )?;
                }
            }
        }
    }
    Ok(())
}

impl RecordStore for SqliteRecordStore {
    fn location(&self) -> &str {
        &self.label
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    fn connect(&mut self) -> Result<(), StoreError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = match &self.location {
            Location::File(path) => Connection::open(path)?,
            Location::Memory => Connection::open_in_memory()?,
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        debug!(store = %self.label, "record store connected");
        self.conn = Some(conn);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.conn.take().is_some() {
            debug!(store = %self.label, "record store disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn()?
            .query_row("SELECT 1 FROM records WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn get(&self, id: &str) -> Result<Option<Record>, StoreError> {
        let conn = self.conn()?;
        let head: Option<(String, String)> = conn
            .query_row(
                "SELECT type, user_defined FROM records WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((record_type, user_defined)) = head else {
            return Ok(None);
        };
        let mut record = Record::new(id, record_type);
        record.user_defined = decode(&user_defined)?;

        let mut stmt = conn.prepare("SELECT name, value FROM scalar_data WHERE id = ?1")?;
        let rows = stmt.query_map([id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (name, raw) = row?;
            record.data.insert(name, Datum::Scalar(decode(&raw)?));
        }

        let mut stmt = conn.prepare("SELECT name, value FROM list_data WHERE id = ?1 ORDER BY name, idx")?;
        let rows = stmt.query_map([id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (name, raw) = row?;
            let value = decode(&raw)?;
            match record.data.entry(name).or_insert_with(|| Datum::List(Vec::new())) {
                Datum::List(items) => items.push(value),
                Datum::Scalar(_) => {}
            }
        }
        Ok(Some(record))
    }

    fn insert(&mut self, record: &Record) -> Result<(), StoreError> {
        if self.exists(&record.id)? {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        let user_defined = encode(&record.user_defined);
        let tx = self.conn_mut()?.transaction()?;
        tx.execute(
            "INSERT INTO records(id, type, user_defined) VALUES (?1, ?2, ?3)",
            params![record.id, record.record_type, user_defined],
        )?;
        write_data(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn update(&mut self, record: &Record) -> Result<(), StoreError> {
        if !self.exists(&record.id)? {
            return Err(StoreError::Missing(record.id.clone()));
        }
        let tx = self.conn_mut()?.transaction()?;
        if !record.user_defined.is_null() {
            tx.execute(
                "UPDATE records SET user_defined = ?2 WHERE id = ?1",
                params![record.id, encode(&record.user_defined)],
            )?;
        }
        write_data(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn query(&self, record_type: &str, filters: &[(String, Value)]) -> Result<Vec<String>, StoreError> {
        let mut sql = String::from("SELECT r.id FROM records r WHERE r.type = ?");
        let mut args: Vec<String> = vec![record_type.to_string()];
        for (name, value) in filters {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM scalar_data s WHERE s.id = r.id AND s.name = ? AND s.value = ?)",
            );
            args.push(name.clone());
            args.push(encode(value));
        }
        sql.push_str(" ORDER BY r.id");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn ids_of_type(&self, record_type: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM records WHERE type = ?1 ORDER BY id")?;
        let rows = stmt.query_map([record_type], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn random_ids(&self, record_type: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM records WHERE type = ?1 ORDER BY RANDOM() LIMIT ?2")?;
        let rows = stmt.query_map(params![record_type, count as i64], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn get_fields(
        &self,
        ids: &[String],
        fields: &[String],
    ) -> Result<BTreeMap<String, BTreeMap<String, Value>>, StoreError> {
        let mut out: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        if ids.is_empty() {
            return Ok(out);
        }
        let conn = self.conn()?;
        let sql = format!("SELECT id FROM records WHERE id IN ({})", placeholders(ids.len()));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| row.get::<_, String>(0))?;
        for row in rows {
            out.insert(row?, BTreeMap::new());
        }
        if fields.is_empty() {
            return Ok(out);
        }
        let sql = format!(
            "SELECT id, name, value FROM scalar_data WHERE id IN ({}) AND name IN ({})",
            placeholders(ids.len()),
            placeholders(fields.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter().chain(fields.iter())), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (id, name, raw) = row?;
            out.entry(id).or_default().insert(name, decode(&raw)?);
        }
        Ok(out)
    }

    fn find_by_values(&self, field: &str, values: &[Value]) -> Result<Vec<(Value, String)>, StoreError> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT value, id FROM scalar_data WHERE name = ? AND value IN ({}) ORDER BY id",
            placeholders(values.len())
        );
        let mut args: Vec<String> = Vec::with_capacity(values.len() + 1);
        args.push(field.to_string());
        args.extend(values.iter().map(encode));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (raw, id) = row?;
            out.push((decode(&raw)?, id));
        }
        Ok(out)
    }

    fn get_list_field(&self, ids: &[String], field: &str) -> Result<BTreeMap<String, Vec<Value>>, StoreError> {
        let mut out: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        if ids.is_empty() {
            return Ok(out);
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT id, value FROM list_data WHERE name = ? AND id IN ({}) ORDER BY id, idx",
            placeholders(ids.len())
        );
        let args = std::iter::once(field.to_string()).chain(ids.iter().cloned());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (id, raw) = row?;
            out.entry(id).or_default().push(decode(&raw)?);
        }
        Ok(out)
    }

    fn insert_relationship(&mut self, subject: &str, predicate: &str, object: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO relationships(subject_id, predicate, object_id) VALUES (?1, ?2, ?3)",
            params![subject, predicate, object],
        )?;
        Ok(())
    }

    fn related_objects(&self, subject: &SubjectMatch, predicate: &str) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.conn()?;
        let (sql, pattern) = match subject {
            SubjectMatch::Is(s) => (
                "SELECT object_id FROM relationships WHERE predicate = ?1 AND subject_id = ?2",
                s.clone(),
            ),
            SubjectMatch::StartsWith(s) => (
                "SELECT object_id FROM relationships WHERE predicate = ?1 AND substr(subject_id, 1, length(?2)) = ?2",
                s.clone(),
            ),
            SubjectMatch::EndsWith(s) => (
                "SELECT object_id FROM relationships WHERE predicate = ?1 AND length(subject_id) >= length(?2) AND substr(subject_id, length(subject_id) - length(?2) + 1) = ?2",
                s.clone(),
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![predicate, pattern], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<BTreeSet<_>, _>>()?)
    }
}
