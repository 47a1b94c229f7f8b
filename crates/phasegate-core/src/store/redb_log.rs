//! Durable instance log backed by redb, one database file per instance.
//!
//! # Layout
//!
//! ```text
//! .workflow/instances/<uuid>.db
//!     log:  seq u64 -> JSON LogEntry
//!     meta: "header" -> JSON InstanceHeader
//! ```
//!
//! redb holds an exclusive lock on an open database file, so a database is
//! opened for a single operation and dropped right after it. Distinct
//! instances live in distinct files and never contend; two short operations
//! on the same instance wait for each other for at most `open_wait`.
//!
//! The directory listing is the instance index: ids come from file names,
//! headers from each file's `meta` table.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use redb::{Database, DatabaseError, ReadableTable, TableDefinition, TableError, WriteTransaction};
use uuid::Uuid;

use super::{stamp, InstanceHeader, InstanceLog, LogEntry, LogRecord};
use crate::error::{storage, Result, WorkflowError};
use crate::template::WorkflowTemplate;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

/// Key: per-instance sequence number
/// Value: JSON-encoded LogEntry
const LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("log");

/// Key: "header"
/// Value: JSON-encoded InstanceHeader
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const HEADER_KEY: &str = "header";

const DB_EXTENSION: &str = "db";

const DEFAULT_OPEN_WAIT: Duration = Duration::from_secs(5);
const OPEN_RETRY: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// RedbLog
// ---------------------------------------------------------------------------

pub struct RedbLog {
    dir: PathBuf,
    open_wait: Duration,
}

impl RedbLog {
    /// Use `dir` as the instance directory, creating it if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(storage)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            open_wait: DEFAULT_OPEN_WAIT,
        })
    }

    /// How long to wait for another process to release an instance file.
    pub fn with_open_wait(mut self, wait: Duration) -> Self {
        self.open_wait = wait;
        self
    }

    fn path(&self, instance: Uuid) -> PathBuf {
        self.dir.join(format!("{instance}.{DB_EXTENSION}"))
    }

    fn database(&self, instance: Uuid) -> Result<Database> {
        let path = self.path(instance);
        if !path.is_file() {
            return Err(WorkflowError::InstanceNotFound(instance.to_string()));
        }
        self.connect(&path)
    }

    fn connect(&self, path: &Path) -> Result<Database> {
        let deadline = Instant::now() + self.open_wait;
        loop {
            match Database::create(path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                    std::thread::sleep(OPEN_RETRY);
                }
                Err(e) => return Err(storage(e)),
            }
        }
    }

    fn read_header(db: &Database) -> Result<Option<InstanceHeader>> {
        let rt = db.begin_read().map_err(storage)?;
        let table = match rt.open_table(META) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(storage(e)),
        };
        let header = match table.get(HEADER_KEY).map_err(storage)? {
            Some(v) => Some(serde_json::from_slice(v.value()).map_err(storage)?),
            None => None,
        };
        Ok(header)
    }

    fn append_in(
        wt: &WriteTransaction,
        instance: Uuid,
        records: Vec<LogRecord>,
    ) -> Result<Vec<LogEntry>> {
        let mut table = wt.open_table(LOG).map_err(storage)?;
        let last = table
            .last()
            .map_err(storage)?
            .map(|(k, _)| k.value())
            .unwrap_or(0);
        // A file without its Started record is a create that never committed.
        if last == 0 {
            return Err(WorkflowError::InstanceNotFound(instance.to_string()));
        }

        let entries = stamp(instance, last + 1, records);
        for entry in &entries {
            let value = serde_json::to_vec(entry).map_err(storage)?;
            table
                .insert(entry.seq, value.as_slice())
                .map_err(storage)?;
        }
        Ok(entries)
    }
}

impl InstanceLog for RedbLog {
    fn create(&self, header: &InstanceHeader, template: &WorkflowTemplate) -> Result<LogEntry> {
        let path = self.path(header.id);
        if path.exists() {
            return Err(storage(format!("instance {} already exists", header.id)));
        }

        let mut entries = stamp(
            header.id,
            1,
            vec![LogRecord::Started {
                template: template.clone(),
            }],
        );
        let entry = entries.remove(0);
        let header_value = serde_json::to_vec(header).map_err(storage)?;
        let entry_value = serde_json::to_vec(&entry).map_err(storage)?;

        let db = self.connect(&path)?;
        let wt = db.begin_write().map_err(storage)?;
        {
            let mut meta = wt.open_table(META).map_err(storage)?;
            meta.insert(HEADER_KEY, header_value.as_slice())
                .map_err(storage)?;
            let mut log = wt.open_table(LOG).map_err(storage)?;
            log.insert(entry.seq, entry_value.as_slice())
                .map_err(storage)?;
        }
        wt.commit().map_err(storage)?;
        Ok(entry)
    }

    fn append(&self, instance: Uuid, records: Vec<LogRecord>) -> Result<Vec<LogEntry>> {
        let db = self.database(instance)?;
        let wt = db.begin_write().map_err(storage)?;
        match Self::append_in(&wt, instance, records) {
            Ok(entries) => {
                wt.commit().map_err(storage)?;
                Ok(entries)
            }
            Err(e) => {
                wt.abort().map_err(storage)?;
                Err(e)
            }
        }
    }

    fn entries(&self, instance: Uuid) -> Result<Vec<LogEntry>> {
        let db = self.database(instance)?;
        let rt = db.begin_read().map_err(storage)?;
        let table = match rt.open_table(LOG) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => {
                return Err(WorkflowError::InstanceNotFound(instance.to_string()))
            }
            Err(e) => return Err(storage(e)),
        };

        let mut result = Vec::new();
        for entry in table.iter().map_err(storage)? {
            let (_, v) = entry.map_err(storage)?;
            let entry: LogEntry = serde_json::from_slice(v.value()).map_err(storage)?;
            result.push(entry);
        }
        if result.is_empty() {
            return Err(WorkflowError::InstanceNotFound(instance.to_string()));
        }
        Ok(result)
    }

    fn instances(&self) -> Result<Vec<InstanceHeader>> {
        let mut result = Vec::new();
        for id in self.ids()? {
            let db = self.database(id)?;
            match Self::read_header(&db)? {
                Some(header) => result.push(header),
                None => tracing::warn!(instance = %id, "instance file has no header, skipping"),
            }
        }
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(result)
    }

    /// Ids from file names alone; no instance file is opened.
    fn ids(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(storage)? {
            let path = entry.map_err(storage)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DB_EXTENSION) {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok());
            if let Some(id) = id {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
