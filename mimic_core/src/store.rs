use crate::header::Header;
use crate::table::{
    MapperStamp, Table, TableError, entry_line, frame_line, header_line, magic_line, mapper_line,
};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    /// An I/O error occurred while reading, appending to or compacting a table file.
    #[error("Table store I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Table(#[from] TableError),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// The persistence boundary of a table build.
///
/// A store owns the [`Table`] it persists. Every `record_*` call either makes
/// the value durable and applies it to the in-memory table, or fails and
/// leaves both untouched. Offering a value that is already recorded returns
/// `Ok(false)` without writing anything; offering a conflicting value fails
/// with the corresponding [`TableError`].
pub trait TableStore {
    fn table(&self) -> &Table;

    fn record_entry(&mut self, position: usize, symbol: char, byte: u8) -> Result<bool, StoreError>;

    fn record_frame(&mut self, offset: usize, byte: u8) -> Result<bool, StoreError>;

    fn record_header(&mut self, header: Header) -> Result<bool, StoreError>;

    fn record_mapper(&mut self, stamp: MapperStamp) -> Result<bool, StoreError>;

    /// Called by the builder after each completed position.
    fn checkpoint(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A store that keeps the table in memory only. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    table: Table,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: Table) -> Self {
        Self { table }
    }

    pub fn into_table(self) -> Table {
        self.table
    }
}

impl TableStore for InMemoryTableStore {
    fn table(&self) -> &Table {
        &self.table
    }

    fn record_entry(&mut self, position: usize, symbol: char, byte: u8) -> Result<bool, StoreError> {
        Ok(self.table.insert(position, symbol, byte)?)
    }

    fn record_frame(&mut self, offset: usize, byte: u8) -> Result<bool, StoreError> {
        Ok(self.table.insert_frame(offset, byte)?)
    }

    fn record_header(&mut self, header: Header) -> Result<bool, StoreError> {
        Ok(self.table.set_header(header)?)
    }

    fn record_mapper(&mut self, stamp: MapperStamp) -> Result<bool, StoreError> {
        Ok(self.table.set_mapper(stamp)?)
    }
}

/// Splits `text` into the part made of complete lines and a trailing fragment
/// without a newline, left behind by a write that was cut short.
fn split_torn_tail(text: &str) -> (&str, Option<&str>) {
    if text.is_empty() || text.ends_with('\n') {
        return (text, None);
    }
    match text.rfind('\n') {
        Some(index) => (&text[..=index], Some(&text[index + 1..])),
        None => ("", Some(text)),
    }
}

/// A table persisted as an append-only text journal.
///
/// Each learned value is appended as one line, then flushed and synced before
/// the in-memory table changes, so an interrupted build leaves at most a torn
/// final line, which is dropped on the next load. [`compact`](Self::compact)
/// rewrites the journal into the canonical one-block-per-position form through
/// a temporary file and an atomic rename; the file is never rewritten in place.
pub struct FileTableStore {
    path: PathBuf,
    table: Table,
    journal: File,
}

impl FileTableStore {
    /// Opens the table at `path` for building, creating it if needed.
    ///
    /// A torn trailing line is cut off the file so later appends start on a
    /// fresh line.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::Io(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let text = if path.exists() {
            fs::read_to_string(&path)
                .map_err(|e| StoreError::Io(format!("Failed to read table {:?}: {}", path, e)))?
        } else {
            String::new()
        };
        let (complete, torn) = split_torn_tail(&text);
        let table = Table::parse(complete)?;

        let mut journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::Io(format!("Failed to open table {:?}: {}", path, e)))?;

        if let Some(fragment) = torn {
            warn!(path = ?path, fragment, "Dropping torn trailing line from table journal");
            journal.set_len(complete.len() as u64).map_err(|e| {
                StoreError::Io(format!("Failed to cut torn line from {:?}: {}", path, e))
            })?;
        }
        if complete.is_empty() {
            journal.write_all(magic_line().as_bytes())?;
            journal.sync_data()?;
        }

        info!(
            path = ?path,
            positions = table.positions().count(),
            entries = table.entry_count(),
            "Opened table store"
        );
        Ok(Self {
            path,
            table,
            journal,
        })
    }

    /// Loads the table at `path` read-only. A torn trailing line is ignored
    /// but left on disk.
    pub fn load(path: &Path) -> Result<Table, StoreError> {
        let text = fs::read_to_string(path)
            .map_err(|e| StoreError::Io(format!("Failed to read table {:?}: {}", path, e)))?;
        let (complete, torn) = split_torn_tail(&text);
        if torn.is_some() {
            warn!(path = ?path, "Ignoring torn trailing line in table journal");
        }
        Ok(Table::parse(complete)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, line: &str) -> Result<(), StoreError> {
        self.journal.write_all(line.as_bytes()).map_err(|e| {
            StoreError::Io(format!("Failed to append to table {:?}: {}", self.path, e))
        })?;
        self.journal.sync_data()?;
        Ok(())
    }

    /// Rewrites the file into canonical form via a temporary sibling and an atomic rename.
    pub fn compact(&mut self) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut temp = NamedTempFile::new_in(&dir).map_err(|e| {
            StoreError::Io(format!("Failed to create temp file in {:?}: {}", dir, e))
        })?;
        temp.write_all(self.table.render().as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| {
            StoreError::Io(format!("Failed to replace table {:?}: {}", self.path, e))
        })?;
        File::open(&dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| StoreError::Io(format!("Failed to sync directory {:?}: {}", dir, e)))?;

        self.journal = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::Io(format!("Failed to reopen table {:?}: {}", self.path, e)))?;
        debug!(path = ?self.path, "Compacted table journal");
        Ok(())
    }
}

impl TableStore for FileTableStore {
    fn table(&self) -> &Table {
        &self.table
    }

    fn record_entry(&mut self, position: usize, symbol: char, byte: u8) -> Result<bool, StoreError> {
        if !self.table.check_entry(position, symbol, byte)? {
            return Ok(false);
        }
        self.append(&entry_line(position, symbol, byte))?;
        Ok(self.table.insert(position, symbol, byte)?)
    }

    fn record_frame(&mut self, offset: usize, byte: u8) -> Result<bool, StoreError> {
        if !self.table.check_frame(offset, byte)? {
            return Ok(false);
        }
        self.append(&frame_line(offset, byte))?;
        Ok(self.table.insert_frame(offset, byte)?)
    }

    fn record_header(&mut self, header: Header) -> Result<bool, StoreError> {
        if !self.table.check_header(&header)? {
            return Ok(false);
        }
        self.append(&header_line(&header))?;
        Ok(self.table.set_header(header)?)
    }

    fn record_mapper(&mut self, stamp: MapperStamp) -> Result<bool, StoreError> {
        if !self.table.check_mapper(&stamp)? {
            return Ok(false);
        }
        self.append(&mapper_line(&stamp))?;
        Ok(self.table.set_mapper(stamp)?)
    }

    fn checkpoint(&mut self) -> Result<(), StoreError> {
        self.compact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::PositionMapper;
    use tempfile::tempdir;

    #[test]
    fn torn_tail_is_split_off() {
        assert_eq!(split_torn_tail(""), ("", None));
        assert_eq!(split_torn_tail("a\nb\n"), ("a\nb\n", None));
        assert_eq!(split_torn_tail("a\nb: {x"), ("a\n", Some("b: {x")));
        assert_eq!(split_torn_tail("partial"), ("", Some("partial")));
    }

    #[test]
    fn in_memory_store_records() {
        let mut store = InMemoryTableStore::new();
        assert!(store.record_entry(0, 'a', 9).unwrap());
        assert!(!store.record_entry(0, 'a', 9).unwrap());
        assert!(matches!(
            store.record_entry(0, 'a', 8),
            Err(StoreError::Table(TableError::Conflict { .. }))
        ));
        assert!(store.record_frame(1, 2).unwrap());
        assert_eq!(store.into_table().get(0, 'a'), Some(9));
    }

    #[test]
    fn file_store_appends_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table.txt");

        let mut store = FileTableStore::open(&path).unwrap();
        store
            .record_header(Header::new(vec![7; 21]).unwrap())
            .unwrap();
        store
            .record_mapper(MapperStamp::of(&PositionMapper::observed()))
            .unwrap();
        store.record_entry(0, 'b', 1).unwrap();
        store.record_frame(3, 4).unwrap();
        store.record_entry(0, 'a', 2).unwrap();
        store.record_entry(1, 'a', 3).unwrap();
        assert!(!store.record_entry(1, 'a', 3).unwrap());
        let expected = store.table().clone();
        drop(store);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 7, "one journal line per record: {text}");
        assert!(text.ends_with("1: {a:3}\n"));

        assert_eq!(FileTableStore::load(&path).unwrap(), expected);
        let reopened = FileTableStore::open(&path).unwrap();
        assert_eq!(reopened.table(), &expected);
    }

    #[test]
    fn conflicting_record_is_not_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table.txt");
        let mut store = FileTableStore::open(&path).unwrap();
        store.record_entry(2, 'x', 10).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        assert!(matches!(
            store.record_entry(2, 'x', 11),
            Err(StoreError::Table(TableError::Conflict { .. }))
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert_eq!(store.table().get(2, 'x'), Some(10));
    }

    #[test]
    fn torn_line_is_dropped_and_cut_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table.txt");
        fs::write(&path, "# mimic-table v1\n0: {a:1}\n0: {b:").unwrap();

        let loaded = FileTableStore::load(&path).unwrap();
        assert_eq!(loaded.entry_count(), 1);
        assert!(fs::read_to_string(&path).unwrap().ends_with("{b:"));

        let mut store = FileTableStore::open(&path).unwrap();
        assert_eq!(store.table().entry_count(), 1);
        store.record_entry(0, 'b', 5).unwrap();
        drop(store);

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# mimic-table v1\n0: {a:1}\n0: {b:5}\n"
        );
    }

    #[test]
    fn compact_rewrites_canonically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("table.txt");
        let mut store = FileTableStore::open(&path).unwrap();
        store.record_entry(1, 'z', 1).unwrap();
        store.record_entry(0, 'q', 2).unwrap();
        store.record_entry(1, 'y', 3).unwrap();
        store.checkpoint().unwrap();

        let canonical = fs::read_to_string(&path).unwrap();
        assert_eq!(canonical, "# mimic-table v1\n0: {q:2}\n1: {z:1, y:3}\n");
        let siblings: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(siblings, vec![std::ffi::OsString::from("table.txt")]);
        assert_eq!(FileTableStore::load(&path).unwrap().render(), canonical);

        store.record_entry(2, 'a', 4).unwrap();
        drop(store);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            format!("{canonical}2: {{a:4}}\n")
        );
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            FileTableStore::load(&dir.path().join("absent.txt")),
            Err(StoreError::Io(_))
        ));
    }
}
