//! Calibration Engine: piecewise-linear adjustment
//! tables keyed by (frequency, reference-power).

use serde::{Deserialize, Serialize};

use crate::error::SdrError;

/// One row of a calibration table's factory or edited row set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRow {
    pub frequency_hz: u64,
    pub ref_power: f32,
    pub reference_value: f64,
    pub adjustment: f64,
}

/// A single named calibration table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationTable {
    pub name: String,
    pub rows: Vec<CalibrationRow>,
    /// Rows this table reverts to when written with an empty row set.
    pub factory_rows: Vec<CalibrationRow>,
    #[serde(skip)]
    selected: Vec<(f64, f64)>,
}

impl CalibrationTable {
    pub fn new(name: impl Into<String>, rows: Vec<CalibrationRow>) -> Self {
        CalibrationTable {
            name: name.into(),
            factory_rows: rows.clone(),
            rows,
            selected: Vec::new(),
        }
    }

    /// Constructs a table whose current rows and factory-default rows differ
    /// (used when reloading a persisted table where the rows on disk have
    /// already diverged from the shipped factory defaults).
    pub fn with_factory_rows(name: impl Into<String>, rows: Vec<CalibrationRow>, factory_rows: Vec<CalibrationRow>) -> Self {
        CalibrationTable {
            name: name.into(),
            rows,
            factory_rows,
            selected: Vec::new(),
        }
    }

    /// Two-step nearest-neighbor selection: nearest frequency, then nearest
    /// reference power among rows at that frequency.
    pub fn select(&mut self, frequency_hz: u64, ref_power: f32) {
        if self.rows.is_empty() {
            self.selected.clear();
            return;
        }
        let nearest_freq = self
            .rows
            .iter()
            .map(|r| r.frequency_hz)
            .min_by_key(|f| f.abs_diff(frequency_hz))
            .unwrap();
        let nearest_power = self
            .rows
            .iter()
            .filter(|r| r.frequency_hz == nearest_freq)
            .map(|r| r.ref_power)
            .min_by(|a, b| {
                (a - ref_power)
                    .abs()
                    .partial_cmp(&(b - ref_power).abs())
                    .unwrap()
            })
            .unwrap();

        let mut points: Vec<(f64, f64)> = self
            .rows
            .iter()
            .filter(|r| r.frequency_hz == nearest_freq && r.ref_power == nearest_power)
            .map(|r| (r.reference_value, r.adjustment))
            .collect();
        points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        points.dedup_by(|a, b| a.0 == b.0);
        self.selected = points;
    }

    /// `measured` passes through untouched when the table is empty/disabled;
    /// otherwise applies the piecewise-linear adjustment function, with
    /// out-of-range inputs extrapolated from the nearest segment's slope.
    pub fn value(&self, measured: f64) -> f64 {
        if self.selected.is_empty() {
            return measured;
        }
        if self.selected.len() == 1 {
            return measured + self.selected[0].1;
        }

        if measured <= self.selected[0].0 {
            let (x0, y0) = self.selected[0];
            let (x1, y1) = self.selected[1];
            let slope = (y1 - y0) / (x1 - x0);
            return measured + (y0 + slope * (measured - x0));
        }
        if measured >= self.selected[self.selected.len() - 1].0 {
            let (x0, y0) = self.selected[self.selected.len() - 2];
            let (x1, y1) = self.selected[self.selected.len() - 1];
            let slope = (y1 - y0) / (x1 - x0);
            return measured + (y1 + slope * (measured - x1));
        }

        for window in self.selected.windows(2) {
            let (x0, y0) = window[0];
            let (x1, y1) = window[1];
            if measured >= x0 && measured <= x1 {
                let t = (measured - x0) / (x1 - x0);
                let adjustment = y0 + t * (y1 - y0);
                return measured + adjustment;
            }
        }
        measured
    }

    /// Replace the row set; an empty set reverts to factory defaults.
    pub fn write_rows(&mut self, rows: Vec<CalibrationRow>) {
        self.rows = if rows.is_empty() { self.factory_rows.clone() } else { rows };
    }
}

/// Holds all registered calibration tables and the global in-progress flag
///.
#[derive(Debug, Default)]
pub struct CalibrationEngine {
    tables: Vec<CalibrationTable>,
    in_progress: bool,
}

impl CalibrationEngine {
    pub fn new(tables: Vec<CalibrationTable>) -> Self {
        CalibrationEngine {
            tables,
            in_progress: false,
        }
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn start_calibration(&mut self) {
        self.in_progress = true;
    }

    pub fn stop_calibration(&mut self) {
        self.in_progress = false;
    }

    /// Rebuild the selected interpolating function for every table.
    pub fn set_mode(&mut self, frequency_hz: u64, ref_power: f32) {
        for table in &mut self.tables {
            table.select(frequency_hz, ref_power);
        }
    }

    pub fn value(&self, index: usize, measured: f64) -> Result<f64, SdrError> {
        let table = self
            .tables
            .get(index)
            .ok_or_else(|| SdrError::NotFound(format!("calibration table {index}")))?;
        if self.in_progress {
            return Ok(measured);
        }
        Ok(table.value(measured))
    }

    pub fn table(&self, index: usize) -> Result<&CalibrationTable, SdrError> {
        self.tables
            .get(index)
            .ok_or_else(|| SdrError::NotFound(format!("calibration table {index}")))
    }

    pub fn write_table(&mut self, index: usize, rows: Vec<CalibrationRow>) -> Result<(), SdrError> {
        let table = self
            .tables
            .get_mut(index)
            .ok_or_else(|| SdrError::NotFound(format!("calibration table {index}")))?;
        table.write_rows(rows);
        table.selected.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> CalibrationTable {
        CalibrationTable::new(
            "llz",
            vec![
                CalibrationRow { frequency_hz: 109_500_000, ref_power: -40.0, reference_value: 0.0, adjustment: 0.0 },
                CalibrationRow { frequency_hz: 109_500_000, ref_power: -40.0, reference_value: 10.0, adjustment: 1.0 },
                CalibrationRow { frequency_hz: 109_500_000, ref_power: -40.0, reference_value: 20.0, adjustment: 3.0 },
            ],
        )
    }

    #[test]
    fn empty_table_is_identity() {
        let table = CalibrationTable::new("empty", Vec::new());
        assert_eq!(table.value(5.0), 5.0);
    }

    #[test]
    fn interpolates_between_rows() {
        let mut table = sample_table();
        table.select(109_500_000, -40.0);
        assert_eq!(table.value(10.0), 11.0);
        assert_eq!(table.value(15.0), 17.0); // 10 + midpoint adjustment (1..3) = 2 -> 15+2
    }

    #[test]
    fn extrapolates_with_endpoint_slope() {
        let mut table = sample_table();
        table.select(109_500_000, -40.0);
        // slope below range is (1-0)/(10-0) = 0.1; at measured=-10 adjustment = -1
        assert_eq!(table.value(-10.0), -11.0);
    }

    #[test]
    fn engine_in_progress_disables_adjustment() {
        let mut engine = CalibrationEngine::new(vec![sample_table()]);
        engine.set_mode(109_500_000, -40.0);
        assert_eq!(engine.value(0, 10.0).unwrap(), 11.0);
        engine.start_calibration();
        assert_eq!(engine.value(0, 10.0).unwrap(), 10.0);
        engine.stop_calibration();
        assert_eq!(engine.value(0, 10.0).unwrap(), 11.0);
    }

    #[test]
    fn out_of_range_index_is_not_found() {
        let engine = CalibrationEngine::new(vec![]);
        assert_eq!(engine.value(0, 1.0), Err(SdrError::NotFound("calibration table 0".into())));
    }

    #[test]
    fn empty_row_write_reverts_to_factory() {
        let mut engine = CalibrationEngine::new(vec![sample_table()]);
        engine.write_table(0, vec![]).unwrap();
        assert_eq!(engine.table(0).unwrap().rows.len(), 3);
    }
}
