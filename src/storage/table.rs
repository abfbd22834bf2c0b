//! Advisory-locked CSV tables.
//!
//! A [`LockedTable`] holds a `flock` on the table file for as long as it
//! lives. Every read-modify-write against a shared table happens through one
//! `LockedTable`, so concurrent processes observe the table either before or
//! after the whole unit, never in between.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use nix::fcntl::{Flock, FlockArg};
use tracing::trace;

use crate::error::TableError;

/// Lock held on a table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers only; any number of holders.
    Shared,
    /// Required for appends and rewrites.
    Exclusive,
}

/// Raw contents of a table: the header row (if any) and every data row in
/// file order. Rows keep whatever field count they had on disk.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub header: Option<StringRecord>,
    pub rows: Vec<StringRecord>,
}

/// An open table file with an advisory lock held until drop.
pub struct LockedTable {
    file: Flock<File>,
    path: PathBuf,
    mode: LockMode,
}

impl LockedTable {
    /// Opens (creating if needed) the table and takes an exclusive lock.
    ///
    /// Blocks until every other holder has released the file.
    pub fn exclusive(path: &Path) -> Result<Self, TableError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::lock(file, path, LockMode::Exclusive)
    }

    /// Opens an existing table under a shared lock.
    ///
    /// Returns `Ok(None)` when the file does not exist yet.
    pub fn shared(path: &Path) -> Result<Option<Self>, TableError> {
        match File::open(path) {
            Ok(file) => Self::lock(file, path, LockMode::Shared).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn lock(file: File, path: &Path, mode: LockMode) -> Result<Self, TableError> {
        let arg = match mode {
            LockMode::Shared => FlockArg::LockShared,
            LockMode::Exclusive => FlockArg::LockExclusive,
        };
        let file = Flock::lock(file, arg).map_err(|(_, errno)| TableError::LockFailed {
            path: path.to_path_buf(),
            reason: errno.to_string(),
        })?;
        trace!(path = %path.display(), ?mode, "Table locked");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole table from the start of the file.
    ///
    /// Rows with a field count different from the header are returned as-is;
    /// invalid UTF-8 is replaced rather than failing the load.
    pub fn read(&mut self) -> Result<RawTable, TableError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(&*self.file);

        let mut table = RawTable::default();
        for record in reader.byte_records() {
            let record = record.map_err(|source| self.csv_error(source))?;
            let record = StringRecord::from_byte_record_lossy(record);
            if table.header.is_none() {
                table.header = Some(record);
            } else {
                table.rows.push(record);
            }
        }
        Ok(table)
    }

    /// Replaces the file contents with `header` followed by `rows`.
    pub fn rewrite(&mut self, header: &StringRecord, rows: &[StringRecord]) -> Result<(), TableError> {
        debug_assert_eq!(self.mode, LockMode::Exclusive);
        let encoded = self.encode(Some(header), rows)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&encoded)?;
        self.file.set_len(encoded.len() as u64)?;
        self.file.sync_all()?;
        trace!(path = %self.path.display(), rows = rows.len(), "Table rewritten");
        Ok(())
    }

    /// Appends `rows`, writing `header` first if the file is empty.
    pub fn append(&mut self, header: &StringRecord, rows: &[StringRecord]) -> Result<(), TableError> {
        debug_assert_eq!(self.mode, LockMode::Exclusive);
        let is_empty = self.file.metadata()?.len() == 0;
        let encoded = self.encode(is_empty.then_some(header), rows)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&encoded)?;
        self.file.sync_data()?;
        trace!(path = %self.path.display(), rows = rows.len(), "Rows appended");
        Ok(())
    }

    fn encode(
        &self,
        header: Option<&StringRecord>,
        rows: &[StringRecord],
    ) -> Result<Vec<u8>, TableError> {
        let mut writer = WriterBuilder::new().flexible(true).from_writer(Vec::new());
        for record in header.into_iter().chain(rows) {
            writer
                .write_record(record)
                .map_err(|source| self.csv_error(source))?;
        }
        writer
            .into_inner()
            .map_err(|e| TableError::Io(e.into_error()))
    }

    fn csv_error(&self, source: csv::Error) -> TableError {
        TableError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}
