//! Durable quarantine work log.
//!
//! The scan phase records every quarantine rename here; the drain
//! phase pops entries oldest-first and removes them. The log is a
//! sqlite table, in memory by default or on disk so an interrupted
//! run can be resumed. All scan writes for one top-level path sit in
//! a single transaction, committed (or rolled back as a unit) before
//! the drain phase reads anything.

use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorklogEntry {
    pub id: i64,
    pub orig_path: PathBuf,
    pub alt_path: PathBuf,
}

pub struct Worklog {
    conn: Connection,
    on_disk: Option<PathBuf>,
}

impl Worklog {
    /// A log that lives and dies with the process. Queued entries are
    /// lost on a crash; their targets remain under quarantine names
    /// and are recognized by a later scan.
    pub fn in_memory() -> Result<Self> {
        debug!("Creating in-memory work log");
        let conn = Connection::open_in_memory()?;
        init(&conn, false)?;
        Ok(Self {
            conn,
            on_disk: None,
        })
    }

    /// A log backed by a file. An extant file is reused with its old
    /// worklog table dropped; whatever the last run committed stays
    /// recoverable until then.
    pub fn at_path(path: &Path) -> Result<Self> {
        debug!("Creating work log at path {}", path.display());
        let extant = path.is_file();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags)?;
        init(&conn, extant)?;
        Ok(Self {
            conn,
            on_disk: Some(path.to_path_buf()),
        })
    }

    /// Record a quarantine rename. Any live entry whose original path
    /// is a `/`-bounded descendant of the new original path is
    /// dropped in the same step; the parent's removal subsumes it.
    /// Paths are stored as raw bytes; filenames are not required to
    /// be UTF-8.
    pub fn add(&mut self, orig_path: &Path, alt_path: &Path) -> Result<()> {
        let orig = orig_path.as_os_str().as_bytes();
        let alt = alt_path.as_os_str().as_bytes();
        self.conn.execute(
            "INSERT INTO worklog (orig_path, alt_path) VALUES (?1, ?2)",
            params![orig, alt],
        )?;
        let pruned = self.conn.execute(
            "DELETE FROM worklog WHERE path_starts_with(orig_path, ?1) <> 0",
            params![orig],
        )?;
        if pruned > 0 {
            debug!("Pruned {pruned} descendant entries of {}", orig_path.display());
        }
        Ok(())
    }

    /// Pop the oldest entry, removing it from the log.
    pub fn next(&mut self) -> Result<Option<WorklogEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT path_id, orig_path, alt_path FROM worklog \
                 ORDER BY path_id ASC LIMIT 1",
                [],
                |row| {
                    Ok(WorklogEntry {
                        id: row.get(0)?,
                        orig_path: path_from_bytes(row.get::<_, Vec<u8>>(1)?),
                        alt_path: path_from_bytes(row.get::<_, Vec<u8>>(2)?),
                    })
                },
            )
            .optional()?;
        if let Some(ref entry) = entry {
            debug!(
                "worklog next: {} (id = {}, orig = {})",
                entry.alt_path.display(),
                entry.id,
                entry.orig_path.display()
            );
            self.conn
                .execute("DELETE FROM worklog WHERE path_id = ?1", params![entry.id])?;
        }
        Ok(entry)
    }

    /// Live entries still queued.
    pub fn remaining(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM worklog", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// End the scan phase for one top-level path: commit its writes
    /// (or discard them wholesale) and open a fresh transaction for
    /// the drain phase.
    pub fn scan_complete(&mut self, discard: bool) -> Result<()> {
        self.conn
            .execute_batch(if discard { "ROLLBACK" } else { "COMMIT" })?;
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    /// Close the log. `keep` commits outstanding work and leaves an
    /// on-disk file in place; otherwise the transaction is rolled
    /// back and the file deleted.
    pub fn close(self, keep: bool) -> Result<()> {
        self.conn
            .execute_batch(if keep { "COMMIT" } else { "ROLLBACK" })?;
        drop(self.conn);
        if let Some(path) = self.on_disk {
            if keep {
                info!("Work log not deleted: {}", path.display());
            } else if let Err(e) = fs::remove_file(&path) {
                warn!("Unable to delete work log {} ({})", path.display(), e);
            } else {
                debug!("Work log deleted: {}", path.display());
            }
        }
        Ok(())
    }
}

fn init(conn: &Connection, extant: bool) -> rusqlite::Result<()> {
    if extant {
        conn.execute_batch("DROP TABLE IF EXISTS worklog")?;
        debug!("Dropped extant worklog table");
    }
    conn.execute_batch(
        "CREATE TABLE worklog (
            path_id        INTEGER PRIMARY KEY,
            orig_path      BLOB UNIQUE NOT NULL,
            alt_path       BLOB UNIQUE NOT NULL
        )",
    )?;
    conn.create_scalar_function(
        "path_starts_with",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let candidate = ctx.get::<Vec<u8>>(0)?;
            let prefix = ctx.get::<Vec<u8>>(1)?;
            Ok(path_starts_with(&candidate, &prefix))
        },
    )?;
    conn.execute_batch("BEGIN")?;
    Ok(())
}

fn path_from_bytes(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(OsString::from_vec(bytes))
}

/// True when `candidate` is a strict descendant of `prefix`: the
/// prefix match must end on a `/` boundary, so `/a/b2` is not under
/// `/a/b`. Operates on raw path bytes.
pub fn path_starts_with(candidate: &[u8], prefix: &[u8]) -> bool {
    candidate.len() > prefix.len()
        && candidate.starts_with(prefix)
        && candidate[prefix.len()] == b'/'
}
