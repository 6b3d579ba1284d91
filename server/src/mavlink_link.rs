//! MAVLink link: the wire-level transport adapter around the pure/async
//! components the rest of this crate builds, covering the command surface,
//! the paginated request streams, and the heartbeat fields.
//!
//! The command surface rides on `COMMAND_LONG`/`COMMAND_ACK`, the one pair of
//! common-dialect messages generic enough to carry an arbitrary opcode plus
//! seven `f32` parameters; `MAV_CMD_USER_1` is the vendor-reserved command id
//! this payload claims, with `param1` carrying the [`SdrOpcode`] discriminant
//! and the remaining `param2..param7` carrying per-opcode arguments. `MavResult`'s
//! existing `ACCEPTED/TEMPORARILY_REJECTED/DENIED/UNSUPPORTED/FAILED/
//! IN_PROGRESS` variants map directly onto this payload's own
//! `Accepted|Failed|Unsupported|Denied` response vocabulary, so no separate
//! result enum is invented. Paginated list/data responses ride on
//! `DATA_TRANSMISSION_HANDSHAKE` (announcing a total item count) followed by
//! one `DATA96` per item, `RecordSendDelayMs` apart, each carrying that
//! item's JSON-encoded representation — the same handshake+chunk shape the
//! common dialect's own image-transfer messages use for bulk data neither
//! side pre-sizes.

use std::sync::Arc;

use mavlink::common::{
    MavMessage, CommandAckData, CommandLongData, DataTransmissionHandshakeData, Data96Data, MavResult,
    MavSeverity, StatustextData,
};
use mavlink::{MavHeader, MavlinkVersion};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sdr_core::{AttitudeSnapshot, GlobalPositionSnapshot, GnssFixType, GnssSnapshot, RecordId, TagKind, WorkModeKind};

use crate::calibration_store::CalibrationStore;
use crate::config::Config;
use crate::error::ServerError;
use crate::mission_executor::MissionExecutor;
use crate::record_store::RecordStore;
use crate::switcher_actor::{SetModeOutcome, StartRecordOutcome, Switcher};
use crate::telemetry::TelemetrySource;

type Connection = dyn mavlink::AsyncMavConnection<MavMessage> + Send + Sync;

/// This payload's own sub-opcode carried in `COMMAND_LONG.param1` under
/// `MAV_CMD_USER_1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum SdrOpcode {
    SetMode = 0,
    StartRecord = 1,
    StopRecord = 2,
    CurrentRecordSetTag = 3,
    StartMission = 4,
    StopMission = 5,
    StartCalibration = 6,
    StopCalibration = 7,
    ReadCalibrationTableInfo = 8,
    ReadCalibrationTableRow = 9,
    WriteCalibrationTable = 10,
    Reboot = 11,
    Shutdown = 12,
    Restart = 13,
    ListRecords = 14,
    ListTags = 15,
    ListDataPages = 16,
    DeleteRecord = 17,
    DeleteTag = 18,
}

impl SdrOpcode {
    fn from_param1(value: f32) -> Option<Self> {
        match value.round() as u32 {
            0 => Some(Self::SetMode),
            1 => Some(Self::StartRecord),
            2 => Some(Self::StopRecord),
            3 => Some(Self::CurrentRecordSetTag),
            4 => Some(Self::StartMission),
            5 => Some(Self::StopMission),
            6 => Some(Self::StartCalibration),
            7 => Some(Self::StopCalibration),
            8 => Some(Self::ReadCalibrationTableInfo),
            9 => Some(Self::ReadCalibrationTableRow),
            10 => Some(Self::WriteCalibrationTable),
            11 => Some(Self::Reboot),
            12 => Some(Self::Shutdown),
            13 => Some(Self::Restart),
            14 => Some(Self::ListRecords),
            15 => Some(Self::ListTags),
            16 => Some(Self::ListDataPages),
            17 => Some(Self::DeleteRecord),
            18 => Some(Self::DeleteTag),
            _ => None,
        }
    }
}

fn work_mode_from_param(value: f32) -> Option<WorkModeKind> {
    match value.round() as u32 {
        0 => Some(WorkModeKind::Idle),
        1 => Some(WorkModeKind::Llz),
        2 => Some(WorkModeKind::Gp),
        3 => Some(WorkModeKind::Vor),
        _ => None,
    }
}

/// Everything the link task needs to service the command surface and
/// telemetry ingestion; composed once at startup and shared with the
/// receive loop.
pub struct LinkContext {
    pub switcher: Arc<Switcher>,
    pub mission: Arc<MissionExecutor>,
    pub calibration: Arc<CalibrationStore>,
    pub record_store: Arc<RecordStore>,
    pub telemetry: Arc<TelemetrySource>,
    pub config: Arc<Config>,
}

/// Connects to `address` (e.g. `udpin:0.0.0.0:14550`) and runs the inbound
/// dispatch loop and the outbound sample-stream forwarder concurrently until
/// `shutdown` fires.
pub async fn run(
    address: &str,
    ctx: LinkContext,
    outbound_rx: mpsc::Receiver<crate::switcher_actor::OutboundSample>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let conn: Box<Connection> = mavlink::connect_async(address)
        .await
        .map_err(|e| ServerError::Mavlink(e.to_string()))?;
    let conn: Arc<Connection> = Arc::from(conn);
    conn.set_protocol_version(MavlinkVersion::V2);

    let recv_conn = conn.clone();
    let recv_ctx = ctx;
    let recv_shutdown = shutdown.clone();
    let recv_task = tokio::spawn(async move { recv_loop(recv_conn, recv_ctx, recv_shutdown).await });

    let send_task = tokio::spawn(send_loop(conn, outbound_rx, shutdown));

    let _ = tokio::join!(recv_task, send_task);
    Ok(())
}

async fn send_loop(conn: Arc<Connection>, mut outbound_rx: mpsc::Receiver<crate::switcher_actor::OutboundSample>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            sample = outbound_rx.recv() => {
                let Some(sample) = sample else { return };
                let header = MavHeader::default();
                for (index, chunk) in sample.payload.chunks(96).enumerate() {
                    let mut data = [0u8; 96];
                    data[..chunk.len()].copy_from_slice(chunk);
                    let msg = MavMessage::DATA96(Data96Data {
                        type_: sample.mode.flag() as u8,
                        len: chunk.len() as u8,
                        data,
                    });
                    if conn.send(&header, &msg).await.is_err() {
                        log::warn!("dropped outbound page {} chunk {index}: send failed", sample.page_index);
                    }
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn recv_loop(conn: Arc<Connection>, ctx: LinkContext, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            received = conn.recv() => {
                match received {
                    Ok((header, message)) => handle_message(&conn, &ctx, header, message).await,
                    Err(e) => log::warn!("mavlink recv error: {e}"),
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn handle_message(conn: &Arc<Connection>, ctx: &LinkContext, header: MavHeader, message: MavMessage) {
    match message {
        MavMessage::HEARTBEAT(_) => {
            if header.system_id != ctx.config.gnss_system_id || header.component_id != ctx.config.gnss_component_id {
                return;
            }
            if ctx.telemetry.on_heartbeat() {
                request_data_streams(conn, ctx, header).await;
            }
        }
        MavMessage::GLOBAL_POSITION_INT(data) => {
            ctx.telemetry.set_global_position(GlobalPositionSnapshot {
                lat_e7: data.lat,
                lon_e7: data.lon,
                alt_mm: data.alt,
                relative_alt_mm: data.relative_alt,
            });
        }
        MavMessage::ATTITUDE(data) => {
            ctx.telemetry.set_attitude(AttitudeSnapshot { roll: data.roll, pitch: data.pitch, yaw: data.yaw });
        }
        MavMessage::GPS_RAW_INT(data) => {
            let fix_type = match data.fix_type {
                mavlink::common::GpsFixType::GPS_FIX_TYPE_2D_FIX => GnssFixType::Fix2d,
                mavlink::common::GpsFixType::GPS_FIX_TYPE_3D_FIX => GnssFixType::Fix3d,
                mavlink::common::GpsFixType::GPS_FIX_TYPE_DGPS => GnssFixType::Dgps,
                mavlink::common::GpsFixType::GPS_FIX_TYPE_RTK_FIXED | mavlink::common::GpsFixType::GPS_FIX_TYPE_RTK_FLOAT => GnssFixType::Rtk,
                _ => GnssFixType::NoGps,
            };
            ctx.telemetry.set_gnss(GnssSnapshot {
                fix_type,
                lat_e7: data.lat,
                lon_e7: data.lon,
                alt_mm: data.alt,
                satellites_visible: data.satellites_visible,
            });
        }
        MavMessage::MISSION_ITEM_REACHED(data) => {
            ctx.telemetry.on_waypoint_reached(data.seq);
        }
        MavMessage::COMMAND_LONG(data) => {
            if data.command == mavlink::common::MavCmd::MAV_CMD_USER_1 {
                dispatch_command(conn, ctx, header, data).await;
            }
        }
        _ => {}
    }
}

async fn request_data_streams(conn: &Arc<Connection>, ctx: &LinkContext, header: MavHeader) {
    let msg = MavMessage::REQUEST_DATA_STREAM(mavlink::common::RequestDataStreamData {
        req_message_rate: ctx.config.req_message_rate as u16,
        target_system: header.system_id,
        target_component: header.component_id,
        req_stream_id: mavlink::common::MavDataStream::MAV_DATA_STREAM_ALL,
        start_stop: 1,
    });
    match conn.send(&MavHeader::default(), &msg).await {
        Ok(_) => ctx.telemetry.on_request_succeeded(),
        Err(_) => ctx.telemetry.on_request_failed(),
    }
}

async fn ack(conn: &Arc<Connection>, result: MavResult) {
    let msg = MavMessage::COMMAND_ACK(CommandAckData {
        command: mavlink::common::MavCmd::MAV_CMD_USER_1,
        result,
    });
    let _ = conn.send(&MavHeader::default(), &msg).await;
}

/// Packs `text` into a `STATUSTEXT` char buffer, truncated to the message's
/// fixed 50-byte field.
fn status_text_chars(text: &str) -> [char; 50] {
    let mut buf = ['\0'; 50];
    for (slot, ch) in buf.iter_mut().zip(text.chars()) {
        *slot = ch;
    }
    buf
}

/// Sends a `STATUSTEXT` carrying a human-readable error line alongside an
/// ack. Every request-handler failure path uses this instead of bare `ack`
/// so the error kind is never the only thing reaching the client.
async fn fail_with_status(conn: &Arc<Connection>, result: MavResult, text: &str) {
    let status = MavMessage::STATUSTEXT(StatustextData {
        severity: MavSeverity::MAV_SEVERITY_ERROR,
        text: status_text_chars(text),
        id: 0,
        chunk_seq: 0,
    });
    let _ = conn.send(&MavHeader::default(), &status).await;
    ack(conn, result).await;
}

/// Routes one `COMMAND_LONG(MAV_CMD_USER_1)` to the component it names and
/// replies with the `MavResult` this payload's own response vocabulary maps
/// onto directly: `ACCEPTED`, `DENIED`, `UNSUPPORTED`, `FAILED`.
async fn dispatch_command(conn: &Arc<Connection>, ctx: &LinkContext, header: MavHeader, data: CommandLongData) {
    let Some(opcode) = SdrOpcode::from_param1(data.param1) else {
        ack(conn, MavResult::MAV_RESULT_UNSUPPORTED).await;
        return;
    };

    let result = match opcode {
        SdrOpcode::SetMode => {
            let Some(mode) = work_mode_from_param(data.param2) else {
                ack(conn, MavResult::MAV_RESULT_UNSUPPORTED).await;
                return;
            };
            let frequency_hz = data.param3 as u64;
            let rate_hz = data.param4;
            let ratio = data.param5 as u32;
            let ref_power = data.param6;
            match ctx.switcher.set_mode(mode, frequency_hz, rate_hz, ratio, ref_power).await {
                Ok(SetModeOutcome::Accepted) => MavResult::MAV_RESULT_ACCEPTED,
                Ok(SetModeOutcome::Unsupported(_)) => MavResult::MAV_RESULT_UNSUPPORTED,
                Err(_) => MavResult::MAV_RESULT_FAILED,
            }
        }
        SdrOpcode::StartRecord => {
            let now_ms = ctx.telemetry.now_ms();
            match ctx.switcher.start_record(format!("record-{now_ms}"), now_ms).await {
                Ok(StartRecordOutcome::Accepted(_)) => MavResult::MAV_RESULT_ACCEPTED,
                Ok(StartRecordOutcome::Denied) => MavResult::MAV_RESULT_DENIED,
                Err(_) => MavResult::MAV_RESULT_FAILED,
            }
        }
        SdrOpcode::StopRecord => {
            let now_ms = ctx.telemetry.now_ms();
            match ctx.switcher.stop_record(now_ms).await {
                Ok(()) => MavResult::MAV_RESULT_ACCEPTED,
                Err(_) => MavResult::MAV_RESULT_FAILED,
            }
        }
        // COMMAND_LONG carries no string payload, so the wire form of this
        // opcode is limited to a fixed name/kind with the value packed into
        // param3; a richer tag name/value needs a dedicated message, out of
        // this repo's scope.
        SdrOpcode::CurrentRecordSetTag => match ctx.switcher.current_record_set_tag(TagKind::Real64, "mavlink-tag", &data.param3.to_le_bytes()) {
            Ok(_) => MavResult::MAV_RESULT_ACCEPTED,
            Err(ServerError::Sdr(sdr_core::SdrError::Denied(_))) => MavResult::MAV_RESULT_DENIED,
            Err(_) => MavResult::MAV_RESULT_FAILED,
        },
        SdrOpcode::StartMission => match ctx.mission.start_mission(data.param2 as u16) {
            Ok(_) => MavResult::MAV_RESULT_ACCEPTED,
            Err(_) => MavResult::MAV_RESULT_FAILED,
        },
        SdrOpcode::StopMission => {
            ctx.mission.stop_mission().await;
            MavResult::MAV_RESULT_ACCEPTED
        }
        SdrOpcode::StartCalibration => {
            ctx.calibration.start_calibration();
            MavResult::MAV_RESULT_ACCEPTED
        }
        SdrOpcode::StopCalibration => {
            ctx.calibration.stop_calibration();
            MavResult::MAV_RESULT_ACCEPTED
        }
        SdrOpcode::ReadCalibrationTableInfo => match ctx.calibration.table_info(data.param2 as usize) {
            Ok(_) => MavResult::MAV_RESULT_ACCEPTED,
            Err(_) => MavResult::MAV_RESULT_FAILED,
        },
        SdrOpcode::ReadCalibrationTableRow => match ctx.calibration.table_row(data.param2 as usize, data.param3 as usize) {
            Ok(_) => MavResult::MAV_RESULT_ACCEPTED,
            Err(_) => MavResult::MAV_RESULT_FAILED,
        },
        SdrOpcode::WriteCalibrationTable => {
            // An empty row set reverts the table to its factory
            // defaults; this sub-opcode carries no row payload over
            // COMMAND_LONG's seven floats, so only that revert path is
            // reachable from the wire today.
            match ctx.calibration.write_table(data.param2 as usize, Vec::new()) {
                Ok(()) => MavResult::MAV_RESULT_ACCEPTED,
                Err(_) => MavResult::MAV_RESULT_FAILED,
            }
        }
        SdrOpcode::Reboot => system_control(SystemControlAction::Reboot),
        SdrOpcode::Shutdown => system_control(SystemControlAction::Shutdown),
        SdrOpcode::Restart => system_control(SystemControlAction::Restart),
        SdrOpcode::ListRecords => {
            send_list_response(conn, ctx, header, data, ListKind::Records).await;
            return;
        }
        SdrOpcode::ListTags => {
            send_list_response(conn, ctx, header, data, ListKind::Tags).await;
            return;
        }
        SdrOpcode::ListDataPages => {
            send_list_response(conn, ctx, header, data, ListKind::DataPages).await;
            return;
        }
        SdrOpcode::DeleteRecord => {
            let Some(id) = record_id_from_params(data.param2, data.param3, data.param4, data.param5) else {
                fail_with_status(conn, MavResult::MAV_RESULT_FAILED, "missing record id").await;
                return;
            };
            match ctx.record_store.delete_file(id) {
                Ok(()) => MavResult::MAV_RESULT_ACCEPTED,
                Err(e @ ServerError::Sdr(sdr_core::SdrError::NotFound(_))) => {
                    fail_with_status(conn, MavResult::MAV_RESULT_FAILED, &e.to_string()).await;
                    return;
                }
                Err(e @ ServerError::Sdr(sdr_core::SdrError::Busy)) => {
                    fail_with_status(conn, MavResult::MAV_RESULT_TEMPORARILY_REJECTED, &e.to_string()).await;
                    return;
                }
                Err(e) => {
                    fail_with_status(conn, MavResult::MAV_RESULT_FAILED, &e.to_string()).await;
                    return;
                }
            }
        }
        SdrOpcode::DeleteTag => {
            // `DeleteTag` is a Writer operation: only the
            // currently open record's tags are reachable, mirroring
            // `CurrentRecordSetTag`.
            let tag_id = sdr_core::TagId(((data.param2 as u32 as u128) << 32) | data.param3 as u32 as u128);
            match ctx.switcher.current_record_delete_tag(tag_id) {
                Ok(()) => MavResult::MAV_RESULT_ACCEPTED,
                Err(e @ ServerError::Sdr(sdr_core::SdrError::Denied(_))) => {
                    fail_with_status(conn, MavResult::MAV_RESULT_DENIED, &e.to_string()).await;
                    return;
                }
                Err(e) => {
                    fail_with_status(conn, MavResult::MAV_RESULT_FAILED, &e.to_string()).await;
                    return;
                }
            }
        }
    };

    ack(conn, result).await;
}

/// Reconstitutes a [`RecordId`] packed across four `f32` params as two
/// `u32` half-words each (the one 128-bit value this command surface needs
/// to carry that doesn't fit any single param).
fn record_id_from_params(p2: f32, p3: f32, p4: f32, p5: f32) -> Option<RecordId> {
    let hi = ((p2 as u32 as u128) << 32) | (p3 as u32 as u128);
    let lo = ((p4 as u32 as u128) << 32) | (p5 as u32 as u128);
    Some(RecordId((hi << 64) | lo))
}

#[derive(Clone, Copy)]
enum ListKind {
    Records,
    Tags,
    DataPages,
}

/// The five request-stream handlers:
/// resolve via the Record Store, `SUCCESS` with the item count, then one
/// `DATA_TRANSMISSION_HANDSHAKE`-announced, `RecordSendDelayMs`-paced item
/// per entry; any failure becomes a `FAILED` ack with no items sent.
async fn send_list_response(conn: &Arc<Connection>, ctx: &LinkContext, _header: MavHeader, data: CommandLongData, kind: ListKind) {
    let skip = data.param2 as u32;
    let count = data.param3 as u32;
    let record_id = record_id_from_params(data.param4, data.param5, data.param6, data.param7);

    let items: Result<Vec<Vec<u8>>, ServerError> = match kind {
        ListKind::Records => Ok(ctx
            .record_store
            .list_ids()
            .into_iter()
            .skip(skip as usize)
            .take(count as usize)
            .filter_map(|id| ctx.record_store.try_get_entry(id))
            .map(|record| serde_json::to_vec(&record.id.to_string()).unwrap_or_default())
            .collect()),
        ListKind::Tags => (|| {
            let id = record_id.ok_or_else(|| ServerError::Sdr(sdr_core::SdrError::Failed("missing record id".into())))?;
            let reader = ctx.record_store.open_file(id)?;
            let ids = reader.tag_ids(skip, count)?;
            Ok(ids.into_iter().map(|t| format!("{:032x}", t.0).into_bytes()).collect())
        })(),
        ListKind::DataPages => (|| {
            let id = record_id.ok_or_else(|| ServerError::Sdr(sdr_core::SdrError::Failed("missing record id".into())))?;
            let reader = ctx.record_store.open_file(id)?;
            let pages = reader.page_range(skip, count)?;
            pages.into_iter().map(|p| reader.read(p).map(|payload| payload.to_vec())).collect()
        })(),
    };

    let items = match items {
        Ok(items) => items,
        Err(e) => {
            fail_with_status(conn, MavResult::MAV_RESULT_FAILED, &e.to_string()).await;
            return;
        }
    };

    ack(conn, MavResult::MAV_RESULT_ACCEPTED).await;
    let handshake = MavMessage::DATA_TRANSMISSION_HANDSHAKE(DataTransmissionHandshakeData {
        size: items.len() as u32,
        width: 0,
        height: 0,
        packets: items.len() as u16,
        type_: kind as u8,
        payload: 96,
        jpg_quality: 0,
    });
    let _ = conn.send(&MavHeader::default(), &handshake).await;

    for item in items {
        for chunk in item.chunks(96) {
            let mut buf = [0u8; 96];
            buf[..chunk.len()].copy_from_slice(chunk);
            let msg = MavMessage::DATA96(Data96Data { type_: kind as u8, len: chunk.len() as u8, data: buf });
            let _ = conn.send(&MavHeader::default(), &msg).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(ctx.config.record_send_delay_ms)).await;
    }
}

enum SystemControlAction {
    Reboot,
    Shutdown,
    Restart,
}

/// System-control handler: OS-specific invocation, unsupported
/// host → `Failed`.
fn system_control(action: SystemControlAction) -> MavResult {
    match action {
        SystemControlAction::Restart => {
            log::warn!("restart requested over mavlink; exiting process");
            std::process::exit(0);
        }
        SystemControlAction::Reboot | SystemControlAction::Shutdown => {
            #[cfg(unix)]
            {
                let verb = match action {
                    SystemControlAction::Reboot => "reboot",
                    SystemControlAction::Shutdown => "poweroff",
                    SystemControlAction::Restart => unreachable!(),
                };
                match std::process::Command::new("sudo").arg("systemctl").arg(verb).status() {
                    Ok(status) if status.success() => MavResult::MAV_RESULT_ACCEPTED,
                    _ => MavResult::MAV_RESULT_FAILED,
                }
            }
            #[cfg(windows)]
            {
                let flag = match action {
                    SystemControlAction::Reboot => "/r",
                    SystemControlAction::Shutdown => "/s",
                    SystemControlAction::Restart => unreachable!(),
                };
                match std::process::Command::new("shutdown").arg(flag).arg("/t").arg("0").status() {
                    Ok(status) if status.success() => MavResult::MAV_RESULT_ACCEPTED,
                    _ => MavResult::MAV_RESULT_FAILED,
                }
            }
            #[cfg(not(any(unix, windows)))]
            {
                MavResult::MAV_RESULT_FAILED
            }
        }
    }
}
