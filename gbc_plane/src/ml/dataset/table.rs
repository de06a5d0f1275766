use std::{collections::HashSet, io, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ml::EncoderError;

/// Raw table of named columns. Cells stay as text so identifier and group
/// columns may hold non-numeric values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl DataTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        let mut seen = HashSet::new();
        if let Some(duplicate) = headers.iter().find(|x| !seen.insert(x.as_str())) {
            Err(EncoderError::invalid_table(format!(
                "duplicate column name '{duplicate}'"
            )))?;
        }
        if let Some((idx, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != headers.len())
        {
            Err(EncoderError::invalid_table(format!(
                "row {idx} has {} cells, expected {}",
                row.len(),
                headers.len()
            )))?;
        }

        Ok(Self { headers, rows })
    }

    pub fn from_csv_reader<R: io::Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = reader
            .headers()
            .context("failed to read table header row")?
            .iter()
            .map(|x| x.to_string())
            .collect();

        let rows = reader
            .records()
            .enumerate()
            .map(|(idx, record)| -> Result<Vec<String>> {
                let record = record.map_err(|e| {
                    EncoderError::invalid_table(format!("failed to read row {idx}: {e}"))
                })?;
                Ok(record.iter().map(|x| x.to_string()).collect())
            })
            .collect::<Result<Vec<Vec<String>>>>()?;

        Self::new(headers, rows)
    }

    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open table at '{}'", path.display()))?;

        let table = Self::from_csv_reader(io::BufReader::new(file))?;
        debug!(
            "Loaded table with {} rows, {} columns from '{}'",
            table.row_count(),
            table.headers.len(),
            path.display()
        );
        Ok(table)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|x| x == name)
    }

    pub fn column(&self, name: &str) -> Result<Vec<&str>> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| EncoderError::invalid_table(format!("column '{name}' not found")))?;

        Ok(self.rows.iter().map(|row| row[idx].as_str()).collect())
    }

    pub fn rows(&self) -> impl Iterator<Item = &[String]> {
        self.rows.iter().map(|x| x.as_slice())
    }
}

/// Which columns are discarded and which become targets when a table is
/// turned into a sample set. Every remaining column is an input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSelector {
    drop_columns: Vec<String>,
    target_pattern: String,
}

impl Default for TableSelector {
    fn default() -> Self {
        Self {
            drop_columns: vec!["Group".to_string(), "id".to_string()],
            target_pattern: "PANSS".to_string(),
        }
    }
}

impl TableSelector {
    pub fn new<S: Into<String>>(drop_columns: Vec<String>, target_pattern: S) -> Self {
        Self {
            drop_columns,
            target_pattern: target_pattern.into(),
        }
    }

    pub fn with_drop_columns(mut self, drop_columns: Vec<String>) -> Self {
        self.drop_columns = drop_columns;
        self
    }

    pub fn with_target_pattern<S: Into<String>>(mut self, target_pattern: S) -> Self {
        self.target_pattern = target_pattern.into();
        self
    }

    pub fn drop_columns(&self) -> &[String] {
        &self.drop_columns
    }

    pub fn target_pattern(&self) -> &str {
        &self.target_pattern
    }

    pub fn is_dropped(&self, column: &str) -> bool {
        self.drop_columns.iter().any(|x| x == column)
    }

    pub fn is_target(&self, column: &str) -> bool {
        column.contains(self.target_pattern.as_str())
    }
}
