//! Dataset stores: get/put whole tables by logical name.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use thiserror::Error;
use tracing::info;

use crate::offer::Table;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),
    #[error("invalid dataset name '{0}': use ASCII letters, digits, '_' or '-'")]
    InvalidDatasetName(String),
    #[error("dataset {0} has no columns")]
    EmptySchema(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

pub trait DatasetStore {
    fn get(&self, name: &str) -> Result<Table, StoreError>;
    fn put(&self, name: &str, table: &Table) -> Result<(), StoreError>;
}

/// One `<name>.csv` file per dataset under `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvDirStore {
    root: PathBuf,
}

impl CsvDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dataset_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(format!("{name}.csv")))
    }
}

impl DatasetStore for CsvDirStore {
    fn get(&self, name: &str) -> Result<Table, StoreError> {
        let path = self.dataset_path(name)?;
        if !path.exists() {
            return Err(StoreError::DatasetNotFound(name.to_string()));
        }

        // Ragged rows are let through; the frame loader reports them by row.
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows: Vec<Vec<String>> = Vec::new();
        for record in reader.records() {
            rows.push(record?.iter().map(str::to_string).collect());
        }

        let table = Table::new(headers, rows);
        info!(
            component = "store",
            event = "store.get",
            backend = "csv",
            dataset = name,
            path = %path.display(),
            rows = table.len()
        );
        Ok(table)
    }

    fn put(&self, name: &str, table: &Table) -> Result<(), StoreError> {
        let path = self.dataset_path(name)?;
        fs::create_dir_all(&self.root)?;
        write_csv_atomic(&path, table)?;
        info!(
            component = "store",
            event = "store.put",
            backend = "csv",
            dataset = name,
            path = %path.display(),
            rows = table.len()
        );
        Ok(())
    }
}

/// One TEXT-column table per dataset inside a single SQLite file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Connection::open(&self.path)?)
    }
}

impl DatasetStore for SqliteStore {
    fn get(&self, name: &str) -> Result<Table, StoreError> {
        validate_name(name)?;
        let conn = self.open()?;
        if !table_exists(&conn, name)? {
            return Err(StoreError::DatasetNotFound(name.to_string()));
        }

        let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY rowid", quote(name)))?;
        let headers: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = headers.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut cells = Vec::with_capacity(width);
            for idx in 0..width {
                cells.push(render_value(row.get_ref(idx)?));
            }
            rows.push(cells);
        }

        let table = Table::new(headers, rows);
        info!(
            component = "store",
            event = "store.get",
            backend = "sqlite",
            dataset = name,
            path = %self.path.display(),
            rows = table.len()
        );
        Ok(table)
    }

    fn put(&self, name: &str, table: &Table) -> Result<(), StoreError> {
        validate_name(name)?;
        if table.headers.is_empty() {
            return Err(StoreError::EmptySchema(name.to_string()));
        }

        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote(name)))?;
        let columns: Vec<String> = table
            .headers
            .iter()
            .map(|header| format!("{} TEXT", quote(header)))
            .collect();
        tx.execute_batch(&format!(
            "CREATE TABLE {} ({});",
            quote(name),
            columns.join(", ")
        ))?;
        {
            let placeholders: Vec<String> =
                (1..=table.headers.len()).map(|idx| format!("?{idx}")).collect();
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} VALUES ({})",
                quote(name),
                placeholders.join(", ")
            ))?;
            for row in &table.rows {
                stmt.execute(params_from_iter(row.iter()))?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.put",
            backend = "sqlite",
            dataset = name,
            path = %self.path.display(),
            rows = table.len()
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    datasets: RwLock<BTreeMap<String, Table>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(name: &str, table: Table) -> Self {
        let store = Self::new();
        if let Ok(mut datasets) = store.datasets.write() {
            datasets.insert(name.to_string(), table);
        }
        store
    }

    pub fn contains(&self, name: &str) -> bool {
        self.datasets
            .read()
            .map(|datasets| datasets.contains_key(name))
            .unwrap_or(false)
    }
}

impl DatasetStore for InMemoryStore {
    fn get(&self, name: &str) -> Result<Table, StoreError> {
        let datasets = self.datasets.read().map_err(|_| StoreError::Poisoned)?;
        datasets
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::DatasetNotFound(name.to_string()))
    }

    fn put(&self, name: &str, table: &Table) -> Result<(), StoreError> {
        let mut datasets = self.datasets.write().map_err(|_| StoreError::Poisoned)?;
        datasets.insert(name.to_string(), table.clone());
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidDatasetName(name.to_string()))
    }
}

fn write_csv_atomic(path: &Path, table: &Table) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| StoreError::InvalidDatasetName(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut writer = csv::Writer::from_path(&tmp_path)?;
        writer.write_record(&table.headers)?;
        for row in &table.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(v) => v.to_string(),
        ValueRef::Real(v) => v.to_string(),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).to_string(),
    }
}
