//! `ReadData` payload composition. Ties together
//! the telemetry snapshot, the active analyzer and the calibration engine
//! into one fixed-size page payload in five steps: page index + record id,
//! GNSS, global position + attitude, analyzer measurement, calibration
//! adjustment.

use sdr_core::{AttitudeSnapshot, GlobalPositionSnapshot, GnssSnapshot, RecordId, TelemetryFrame, PAGE_PAYLOAD_SIZE};

use crate::analyzer::Analyzer;
use crate::calibration_store::CalibrationStore;
use crate::error::ServerError;

const PAGE_INDEX_OFFSET: usize = 0;
const PAGE_INDEX_LEN: usize = 4;
const RECORD_ID_OFFSET: usize = PAGE_INDEX_OFFSET + PAGE_INDEX_LEN;
const RECORD_ID_LEN: usize = 16;
const GNSS_OFFSET: usize = RECORD_ID_OFFSET + RECORD_ID_LEN;
const GNSS_LEN: usize = 14; // fix_type(1) + lat(4) + lon(4) + alt(4) + satellites(1)
const ATTITUDE_OFFSET: usize = GNSS_OFFSET + GNSS_LEN;
const ATTITUDE_LEN: usize = 12; // roll/pitch/yaw, f32 each
const GLOBAL_POS_OFFSET: usize = ATTITUDE_OFFSET + ATTITUDE_LEN;
const GLOBAL_POS_LEN: usize = 16; // lat/lon/alt/relative_alt, i32 each
const MEASUREMENT_OFFSET: usize = GLOBAL_POS_OFFSET + GLOBAL_POS_LEN;
/// Bytes left in the page for the analyzer's mode-specific measurement,
/// after the page index, record id, GNSS, attitude and global position
/// header fields occupy the rest.
pub const MEASUREMENT_LEN: usize = PAGE_PAYLOAD_SIZE - MEASUREMENT_OFFSET;

fn write_gnss(buf: &mut [u8], gnss: GnssSnapshot) {
    buf[GNSS_OFFSET] = gnss.fix_type as u8;
    buf[GNSS_OFFSET + 1..GNSS_OFFSET + 5].copy_from_slice(&gnss.lat_e7.to_le_bytes());
    buf[GNSS_OFFSET + 5..GNSS_OFFSET + 9].copy_from_slice(&gnss.lon_e7.to_le_bytes());
    buf[GNSS_OFFSET + 9..GNSS_OFFSET + 13].copy_from_slice(&gnss.alt_mm.to_le_bytes());
    buf[GNSS_OFFSET + 13] = gnss.satellites_visible;
}

fn write_attitude(buf: &mut [u8], attitude: AttitudeSnapshot) {
    buf[ATTITUDE_OFFSET..ATTITUDE_OFFSET + 4].copy_from_slice(&attitude.roll.to_le_bytes());
    buf[ATTITUDE_OFFSET + 4..ATTITUDE_OFFSET + 8].copy_from_slice(&attitude.pitch.to_le_bytes());
    buf[ATTITUDE_OFFSET + 8..ATTITUDE_OFFSET + 12].copy_from_slice(&attitude.yaw.to_le_bytes());
}

fn write_global_position(buf: &mut [u8], pos: GlobalPositionSnapshot) {
    buf[GLOBAL_POS_OFFSET..GLOBAL_POS_OFFSET + 4].copy_from_slice(&pos.lat_e7.to_le_bytes());
    buf[GLOBAL_POS_OFFSET + 4..GLOBAL_POS_OFFSET + 8].copy_from_slice(&pos.lon_e7.to_le_bytes());
    buf[GLOBAL_POS_OFFSET + 8..GLOBAL_POS_OFFSET + 12].copy_from_slice(&pos.alt_mm.to_le_bytes());
    buf[GLOBAL_POS_OFFSET + 12..GLOBAL_POS_OFFSET + 16].copy_from_slice(&pos.relative_alt_mm.to_le_bytes());
}

/// Composes one page's payload: stamps `page_index`
/// and `record_id`, zero-fills telemetry fields absent from `telemetry`,
/// delegates to `analyzer` for the measurement bytes, then applies the
/// calibration table selected for `calibration_table_index` (when `Some`)
/// to the measurement bytes' leading `f64`, the one measurement field
/// treated as calibration-adjusted.
pub fn compose(
    page_index: u32,
    record_id: RecordId,
    telemetry: &TelemetryFrame,
    analyzer: &dyn Analyzer,
    calibration: &CalibrationStore,
    calibration_table_index: Option<usize>,
) -> Result<[u8; PAGE_PAYLOAD_SIZE], ServerError> {
    let mut buf = [0u8; PAGE_PAYLOAD_SIZE];

    buf[PAGE_INDEX_OFFSET..PAGE_INDEX_OFFSET + PAGE_INDEX_LEN].copy_from_slice(&page_index.to_le_bytes());
    buf[RECORD_ID_OFFSET..RECORD_ID_OFFSET + RECORD_ID_LEN].copy_from_slice(&record_id.0.to_le_bytes());

    write_gnss(&mut buf, telemetry.gnss_or_zero());
    write_attitude(&mut buf, telemetry.attitude_or_zero());
    write_global_position(&mut buf, telemetry.global_position_or_zero());

    analyzer.fill_measurement(&mut buf[MEASUREMENT_OFFSET..]);

    if let Some(index) = calibration_table_index {
        let measured = f64::from_le_bytes(buf[MEASUREMENT_OFFSET..MEASUREMENT_OFFSET + 8].try_into().unwrap());
        let corrected = calibration.value(index, measured)?;
        buf[MEASUREMENT_OFFSET..MEASUREMENT_OFFSET + 8].copy_from_slice(&corrected.to_le_bytes());
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdr_core::{CalibrationRow, CalibrationTable, GnssFixType};

    struct FixedAnalyzer;

    #[async_trait::async_trait]
    impl Analyzer for FixedAnalyzer {
        async fn init(&self, _f: u64, _r: f32, _c: tokio_util::sync::CancellationToken) -> Result<(), sdr_core::SdrError> {
            Ok(())
        }
        fn mode(&self) -> sdr_core::WorkModeKind {
            sdr_core::WorkModeKind::Llz
        }
        fn signal_overflow(&self) -> f32 {
            0.0
        }
        fn fill_measurement(&self, buf: &mut [u8]) {
            buf[0..8].copy_from_slice(&10.0f64.to_le_bytes());
        }
    }

    #[test]
    fn composes_header_fields_and_applies_calibration() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::calibration_store::CalibrationStore::open(dir.path()).unwrap();

        let id = RecordId::from_u128(42);
        let mut telemetry = TelemetryFrame::default();
        telemetry.gnss = Some(GnssSnapshot { fix_type: GnssFixType::Fix3d, lat_e7: 1, lon_e7: 2, alt_mm: 3, satellites_visible: 9 });

        let payload = compose(5, id, &telemetry, &FixedAnalyzer, &store, None).unwrap();
        assert_eq!(u32::from_le_bytes(payload[0..4].try_into().unwrap()), 5);
        assert_eq!(u128::from_le_bytes(payload[4..20].try_into().unwrap()), 42);
        assert_eq!(payload[GNSS_OFFSET], GnssFixType::Fix3d as u8);
        assert_eq!(f64::from_le_bytes(payload[MEASUREMENT_OFFSET..MEASUREMENT_OFFSET + 8].try_into().unwrap()), 10.0);
    }

    #[test]
    fn calibration_table_adjusts_measurement_when_selected() {
        let dir = tempfile::tempdir().unwrap();
        let table = CalibrationTable::new(
            "llz",
            vec![CalibrationRow { frequency_hz: 1, ref_power: 0.0, reference_value: 10.0, adjustment: 5.0 }],
        );
        let table_path = dir.path().join("llz.json");
        std::fs::write(
            &table_path,
            serde_json::to_vec(&serde_json::json!({"name": "llz", "rows": table.rows, "factory_rows": table.factory_rows})).unwrap(),
        )
        .unwrap();
        let store = crate::calibration_store::CalibrationStore::open(dir.path()).unwrap();
        store.set_mode(1, 0.0);

        let id = RecordId::from_u128(1);
        let telemetry = TelemetryFrame::default();
        let payload = compose(0, id, &telemetry, &FixedAnalyzer, &store, Some(0)).unwrap();
        let measured = f64::from_le_bytes(payload[MEASUREMENT_OFFSET..MEASUREMENT_OFFSET + 8].try_into().unwrap());
        assert_eq!(measured, 15.0);
    }
}
