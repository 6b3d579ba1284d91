//! File-I/O side of the Calibration Engine: loads
//! and persists one textual file per table under `CalibrationFolder`,
//! wrapping the pure `sdr_core::CalibrationEngine` lookup logic with its
//! on-disk counterpart. JSON is used for the same reason the rest of this
//! crate reaches for `serde_json` over a custom binary format for anything
//! that isn't the bulk sample data.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use sdr_core::{CalibrationEngine, CalibrationRow, CalibrationTable};

use crate::error::ServerError;

#[derive(Debug, Serialize, Deserialize)]
struct TableFile {
    name: String,
    rows: Vec<CalibrationRow>,
    factory_rows: Vec<CalibrationRow>,
}

fn table_path(folder: &Path, name: &str) -> PathBuf {
    folder.join(format!("{name}.json"))
}

fn write_table_file(folder: &Path, table: &CalibrationTable) -> Result<(), ServerError> {
    let file = TableFile {
        name: table.name.clone(),
        rows: table.rows.clone(),
        factory_rows: table.factory_rows.clone(),
    };
    fs::write(table_path(folder, &table.name), serde_json::to_vec_pretty(&file)?)?;
    Ok(())
}

/// Loads every `*.json` table file in `folder` (creating it if absent) into
/// an engine, and exposes `write_table` which persists through to disk
/// after delegating to the pure engine's row replacement.
pub struct CalibrationStore {
    folder: PathBuf,
    engine: Mutex<CalibrationEngine>,
    /// Table names in load order, so index <-> name is stable across a run.
    names: Mutex<Vec<String>>,
}

impl CalibrationStore {
    pub fn open(folder: impl Into<PathBuf>) -> Result<Arc<Self>, ServerError> {
        let folder = folder.into();
        fs::create_dir_all(&folder)?;

        let mut tables = Vec::new();
        let mut names = Vec::new();
        let mut file_names: Vec<_> = fs::read_dir(&folder)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        file_names.sort();
        for path in file_names {
            let text = fs::read_to_string(&path)?;
            let parsed: TableFile = serde_json::from_str(&text)?;
            let factory_rows = if parsed.factory_rows.is_empty() {
                parsed.rows.clone()
            } else {
                parsed.factory_rows
            };
            names.push(parsed.name.clone());
            tables.push(CalibrationTable::with_factory_rows(parsed.name, parsed.rows, factory_rows));
        }

        log::info!("calibration store opened at {} with {} table(s)", folder.display(), tables.len());

        Ok(Arc::new(CalibrationStore {
            folder,
            engine: Mutex::new(CalibrationEngine::new(tables)),
            names: Mutex::new(names),
        }))
    }

    pub fn set_mode(&self, frequency_hz: u64, ref_power: f32) {
        self.engine.lock().unwrap().set_mode(frequency_hz, ref_power);
    }

    pub fn value(&self, index: usize, measured: f64) -> Result<f64, ServerError> {
        self.engine.lock().unwrap().value(index, measured).map_err(ServerError::Sdr)
    }

    pub fn table_count(&self) -> usize {
        self.engine.lock().unwrap().table_count()
    }

    pub fn start_calibration(&self) {
        self.engine.lock().unwrap().start_calibration();
    }

    pub fn stop_calibration(&self) {
        self.engine.lock().unwrap().stop_calibration();
    }

    pub fn in_progress(&self) -> bool {
        self.engine.lock().unwrap().in_progress()
    }

    /// `WriteCalibrationTable(index, meta, rows)`: replaces rows, persists to
    /// disk, and recomputes selection. An empty row set reverts to the
    /// table's factory default rows (handled by the pure engine).
    pub fn write_table(&self, index: usize, rows: Vec<CalibrationRow>) -> Result<(), ServerError> {
        let mut engine = self.engine.lock().unwrap();
        engine.write_table(index, rows).map_err(ServerError::Sdr)?;
        let table = engine.table(index).map_err(ServerError::Sdr)?;
        write_table_file(&self.folder, table)?;
        Ok(())
    }

    pub fn table_rows(&self, index: usize) -> Result<Vec<CalibrationRow>, ServerError> {
        let engine = self.engine.lock().unwrap();
        Ok(engine.table(index).map_err(ServerError::Sdr)?.rows.clone())
    }

    /// `ReadCalibrationTableInfo(index)`: name plus row count.
    pub fn table_info(&self, index: usize) -> Result<CalibrationTableInfo, ServerError> {
        let names = self.names.lock().unwrap();
        let name = names
            .get(index)
            .cloned()
            .ok_or_else(|| ServerError::Sdr(sdr_core::SdrError::NotFound(format!("calibration table {index}"))))?;
        let row_count = self.table_rows(index)?.len();
        Ok(CalibrationTableInfo { name, row_count })
    }

    /// `ReadCalibrationTableRow(index, rowIndex)`.
    pub fn table_row(&self, index: usize, row_index: usize) -> Result<CalibrationRow, ServerError> {
        let rows = self.table_rows(index)?;
        rows.get(row_index)
            .copied()
            .ok_or_else(|| ServerError::Sdr(sdr_core::SdrError::NotFound(format!("calibration row {row_index}"))))
    }
}

/// `ReadCalibrationTableInfo(index)` result.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationTableInfo {
    pub name: String,
    pub row_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(freq: u64, power: f32, value: f64, adj: f64) -> CalibrationRow {
        CalibrationRow {
            frequency_hz: freq,
            ref_power: power,
            reference_value: value,
            adjustment: adj,
        }
    }

    #[test]
    fn write_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CalibrationStore::open(dir.path()).unwrap();
            // Seed one table by writing directly to disk the way a first-boot
            // factory provisioning step would.
            let table = CalibrationTable::new("llz", vec![row(109_500_000, -40.0, 0.0, 1.0)]);
            write_table_file(dir.path(), &table).unwrap();
        }
        let store = CalibrationStore::open(dir.path()).unwrap();
        assert_eq!(store.table_count(), 1);
        assert_eq!(store.table_rows(0).unwrap().len(), 1);
    }

    #[test]
    fn empty_write_reverts_to_factory_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let table = CalibrationTable::new("llz", vec![row(1, -40.0, 0.0, 1.0), row(1, -40.0, 10.0, 2.0)]);
        write_table_file(dir.path(), &table).unwrap();
        let store = CalibrationStore::open(dir.path()).unwrap();
        store.write_table(0, vec![row(1, -40.0, 5.0, 9.0)]).unwrap();
        assert_eq!(store.table_rows(0).unwrap().len(), 1);
        store.write_table(0, vec![]).unwrap();
        assert_eq!(store.table_rows(0).unwrap().len(), 2);

        // Reopen and confirm the revert was actually persisted to disk.
        drop(store);
        let reopened = CalibrationStore::open(dir.path()).unwrap();
        assert_eq!(reopened.table_rows(0).unwrap().len(), 2);
    }

    #[test]
    fn out_of_range_index_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(dir.path()).unwrap();
        assert!(store.write_table(0, vec![]).is_err());
    }
}
