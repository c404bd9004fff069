//! Tabular data sources.

use super::DataSource;
use crate::config::DataSourceSettings;
use crate::error::ProviderError;
use crate::recovery::Remedy;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

fn io_error(path: &Path, e: io::Error) -> ProviderError {
    match e.kind() {
        io::ErrorKind::NotFound => ProviderError::FileNotFound(path.display().to_string()),
        io::ErrorKind::PermissionDenied => ProviderError::Locked(path.display().to_string()),
        _ => ProviderError::Backend(format!("{}: {}", path.display(), e)),
    }
}

/// CSV file with a header row. Row status is kept in a dedicated column,
/// which is appended when the file has none.
pub struct CsvDataSource {
    path: PathBuf,
    delimiter: u8,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    status_col: usize,
    status_name: String,
    dirty: bool,
}

impl CsvDataSource {
    /// Opens `path`, requiring valid UTF-8.
    pub fn open(
        path: impl AsRef<Path>,
        settings: &DataSourceSettings,
    ) -> Result<Self, ProviderError> {
        Self::load(path.as_ref(), settings, false)
    }

    /// Opens `path`, replacing invalid byte sequences instead of failing.
    pub fn open_lossy(
        path: impl AsRef<Path>,
        settings: &DataSourceSettings,
    ) -> Result<Self, ProviderError> {
        Self::load(path.as_ref(), settings, true)
    }

    fn load(
        path: &Path,
        settings: &DataSourceSettings,
        lossy: bool,
    ) -> Result<Self, ProviderError> {
        let bytes = std::fs::read(path).map_err(|e| io_error(path, e))?;
        let text = if lossy {
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            String::from_utf8(bytes).map_err(|e| {
                ProviderError::Backend(format!(
                    "failed to decode {} as utf-8 (encoding error at byte {})",
                    path.display(),
                    e.utf8_error().valid_up_to()
                ))
            })?
        };
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
        let delimiter = u8::try_from(settings.delimiter).unwrap_or(b',');

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(text.as_bytes());
        let mut headers: Vec<String> = reader
            .headers()
            .map_err(|e| ProviderError::Backend(format!("invalid csv header: {}", e)))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record =
                record.map_err(|e| ProviderError::Backend(format!("invalid csv record: {}", e)))?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }

        let status_col = match headers.iter().position(|h| h == &settings.status_column) {
            Some(i) => i,
            None => {
                headers.push(settings.status_column.clone());
                for row in &mut rows {
                    row.push(String::new());
                }
                headers.len() - 1
            }
        };
        log::info!(
            "Loaded {} rows ({} columns) from {}",
            rows.len(),
            headers.len(),
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            delimiter,
            headers,
            rows,
            status_col,
            status_name: settings.status_column.clone(),
            dirty: false,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn status(&self, index: usize) -> Option<&str> {
        self.rows.get(index).map(|r| r[self.status_col].as_str())
    }

    fn reload(&mut self, lossy: bool) -> Result<(), ProviderError> {
        let settings = DataSourceSettings {
            status_column: self.status_name.clone(),
            delimiter: char::from(self.delimiter),
        };
        let mut fresh = Self::load(&self.path, &settings, lossy)?;
        // Statuses set during this run survive the reload, row by row.
        let col = fresh.status_col;
        for (index, row) in fresh.rows.iter_mut().enumerate() {
            let Some(status) = self.status(index) else {
                break;
            };
            if row[col] != status {
                row[col] = status.to_string();
                fresh.dirty = true;
            }
        }
        fresh.dirty |= self.dirty;
        *self = fresh;
        Ok(())
    }
}

impl DataSource for CsvDataSource {
    fn source_id(&self) -> String {
        self.path.display().to_string()
    }

    fn total_rows(&self) -> usize {
        self.rows.len()
    }

    fn get_row(&self, index: usize) -> Result<HashMap<String, String>, ProviderError> {
        let row = self.rows.get(index).ok_or_else(|| {
            ProviderError::Backend(format!(
                "row {} not found ({} rows)",
                index,
                self.rows.len()
            ))
        })?;
        Ok(self
            .headers
            .iter()
            .cloned()
            .zip(row.iter().cloned())
            .collect())
    }

    fn update_row_status(&mut self, index: usize, status: &str) -> Result<(), ProviderError> {
        let col = self.status_col;
        let row = self
            .rows
            .get_mut(index)
            .ok_or_else(|| ProviderError::Backend(format!("row {} not found", index)))?;
        row[col] = status.to_string();
        self.dirty = true;
        Ok(())
    }

    fn pending_rows(&self) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r[self.status_col].trim().is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    fn recover(&mut self, remedy: &Remedy) -> Result<(), ProviderError> {
        match remedy {
            Remedy::RetryWithAlternateEncoding => self.reload(true),
            Remedy::CloseAndRetry => self.reload(false),
            Remedy::NormalizeColumnNames => {
                for h in &mut self.headers {
                    *h = h.trim().to_string();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn save(&mut self) -> Result<(), ProviderError> {
        if !self.dirty {
            return Ok(());
        }
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_path(&self.path)
            .map_err(|e| {
                ProviderError::Backend(format!("cannot write {}: {}", self.path.display(), e))
            })?;
        let write_err = |e: csv::Error| ProviderError::Backend(format!("csv write failed: {}", e));
        writer.write_record(&self.headers).map_err(write_err)?;
        for row in &self.rows {
            writer.write_record(row).map_err(write_err)?;
        }
        writer
            .flush()
            .map_err(|e| io_error(&self.path, e))?;
        self.dirty = false;
        log::info!("Saved row statuses to {}", self.path.display());
        Ok(())
    }
}

/// In-memory rows, handy for tests and programmatic runs.
#[derive(Default)]
pub struct VecDataSource {
    rows: Vec<HashMap<String, String>>,
    statuses: Vec<String>,
    failing: HashMap<usize, ProviderError>,
    saves: usize,
}

impl VecDataSource {
    pub fn new(rows: Vec<HashMap<String, String>>) -> Self {
        let statuses = vec![String::new(); rows.len()];
        Self {
            rows,
            statuses,
            failing: HashMap::new(),
            saves: 0,
        }
    }

    /// One row per value, each with a single `column`.
    pub fn from_column(column: &str, values: &[&str]) -> Self {
        Self::new(
            values
                .iter()
                .map(|v| HashMap::from([(column.to_string(), v.to_string())]))
                .collect(),
        )
    }

    /// Makes `get_row(index)` fail with `error`.
    pub fn with_failing_row(mut self, index: usize, error: ProviderError) -> Self {
        self.failing.insert(index, error);
        self
    }

    pub fn statuses(&self) -> &[String] {
        &self.statuses
    }

    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl DataSource for VecDataSource {
    fn source_id(&self) -> String {
        "memory".to_string()
    }

    fn total_rows(&self) -> usize {
        self.rows.len()
    }

    fn get_row(&self, index: usize) -> Result<HashMap<String, String>, ProviderError> {
        if let Some(err) = self.failing.get(&index) {
            return Err(err.clone());
        }
        self.rows
            .get(index)
            .cloned()
            .ok_or_else(|| ProviderError::Backend(format!("row {} not found", index)))
    }

    fn update_row_status(&mut self, index: usize, status: &str) -> Result<(), ProviderError> {
        match self.statuses.get_mut(index) {
            Some(s) => {
                *s = status.to_string();
                Ok(())
            }
            None => Err(ProviderError::Backend(format!("row {} not found", index))),
        }
    }

    fn pending_rows(&self) -> Vec<usize> {
        (0..self.rows.len())
            .filter(|i| self.statuses[*i].is_empty())
            .collect()
    }

    fn save(&mut self) -> Result<(), ProviderError> {
        self.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_rows_status_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "\u{feff}name,target,status\nA,x,\nB,y,completed\nC,z,\n").unwrap();

        let mut source = CsvDataSource::open(&path, &DataSourceSettings::default()).unwrap();
        assert_eq!(source.total_rows(), 3);
        assert_eq!(source.pending_rows(), vec![0, 2]);
        assert_eq!(source.get_row(2).unwrap()["target"], "z");

        source.update_row_status(0, "completed").unwrap();
        source.save().unwrap();

        let reopened = CsvDataSource::open(&path, &DataSourceSettings::default()).unwrap();
        assert_eq!(reopened.status(0), Some("completed"));
        assert_eq!(reopened.pending_rows(), vec![2]);
    }

    #[test]
    fn status_column_is_added_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "name\nA\n").unwrap();
        let source = CsvDataSource::open(&path, &DataSourceSettings::default()).unwrap();
        assert_eq!(source.headers(), ["name", "status"]);
        assert_eq!(source.pending_rows(), vec![0]);
    }

    #[test]
    fn invalid_utf8_needs_lossy_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, b"name\n\xff\xfeA\n").unwrap();
        let err = CsvDataSource::open(&path, &DataSourceSettings::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("encoding"));
        let source = CsvDataSource::open_lossy(&path, &DataSourceSettings::default()).unwrap();
        assert_eq!(source.total_rows(), 1);
    }

    #[test]
    fn statuses_survive_recovery_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "name,status\nA,\nB,\nC,\n").unwrap();
        let mut source = CsvDataSource::open(&path, &DataSourceSettings::default()).unwrap();
        source.update_row_status(0, "completed").unwrap();
        source.update_row_status(1, "failed: click: boom").unwrap();

        source.recover(&Remedy::RetryWithAlternateEncoding).unwrap();
        assert_eq!(source.status(0), Some("completed"));
        assert_eq!(source.status(1), Some("failed: click: boom"));
        assert_eq!(source.pending_rows(), vec![2]);

        source.recover(&Remedy::CloseAndRetry).unwrap();
        source.save().unwrap();
        let reopened = CsvDataSource::open(&path, &DataSourceSettings::default()).unwrap();
        assert_eq!(reopened.status(1), Some("failed: click: boom"));
    }

    #[test]
    fn missing_file_maps_to_file_not_found() {
        let err = CsvDataSource::open("/no/such/data.csv", &DataSourceSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::FileNotFound(_)));
    }

    #[test]
    fn vec_source_tracks_statuses() {
        let mut source = VecDataSource::from_column("target", &["A", "B"]);
        source.update_row_status(1, "failed: x").unwrap();
        assert_eq!(source.pending_rows(), vec![0]);
        assert_eq!(source.statuses()[1], "failed: x");
        source.save().unwrap();
        assert_eq!(source.save_count(), 1);
    }
}
