//! Telemetry Source async shell: wraps the pure
//! [`sdr_core::TelemetryLink`] link-state machine and
//! [`sdr_core::WaypointTracker`] with the "observable last-value cell"
//! primitive spec §9 calls for — a `tokio::sync::watch` channel, which
//! already carries last-value semantics for free, the same shape the
//! teacher's `core::connection::ConnectionManager` status field is read
//! through from multiple tasks.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;

use sdr_core::{AttitudeSnapshot, GlobalPositionSnapshot, GnssSnapshot, LinkState, TelemetryFrame, TelemetryLink, WaypointTracker};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shared telemetry snapshot, readable from the sample tick, the request
/// handlers and the mission executor's `WaitVehicleWaypoint`. Callers read
/// the *current* value, which may be stale per spec §4.1's best-effort
/// error semantics.
pub struct TelemetrySource {
    link: Mutex<TelemetryLink>,
    waypoints: Mutex<WaypointTracker>,
    gnss_tx: watch::Sender<Option<GnssSnapshot>>,
    attitude_tx: watch::Sender<Option<AttitudeSnapshot>>,
    position_tx: watch::Sender<Option<GlobalPositionSnapshot>>,
    link_state_tx: watch::Sender<LinkState>,
    waypoint_tx: watch::Sender<Option<u16>>,
    /// Caller-settable offset (milliseconds) applied to wall-clock `Now`,
    /// for time synchronization to GNSS UTC.
    clock_offset_ms: AtomicI64,
}

impl TelemetrySource {
    pub fn new(device_timeout_ms: u64) -> Self {
        let (gnss_tx, _) = watch::channel(None);
        let (attitude_tx, _) = watch::channel(None);
        let (position_tx, _) = watch::channel(None);
        let (link_state_tx, _) = watch::channel(LinkState::Disconnected);
        let (waypoint_tx, _) = watch::channel(None);
        TelemetrySource {
            link: Mutex::new(TelemetryLink::new(device_timeout_ms)),
            waypoints: Mutex::new(WaypointTracker::new()),
            gnss_tx,
            attitude_tx,
            position_tx,
            link_state_tx,
            waypoint_tx,
            clock_offset_ms: AtomicI64::new(0),
        }
    }

    /// Corrected wall clock, in milliseconds since epoch.
    pub fn now_ms(&self) -> u64 {
        (now_ms() as i64 + self.clock_offset_ms.load(Ordering::Relaxed)) as u64
    }

    pub fn set_clock_offset_ms(&self, offset_ms: i64) {
        self.clock_offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// Feeds a heartbeat in; returns whether the caller owes the autopilot
    /// a fresh data-stream request.
    pub fn on_heartbeat(&self) -> bool {
        let poll = self.link.lock().unwrap().on_heartbeat(self.now_ms());
        let _ = self.link_state_tx.send(poll.state);
        poll.should_request_streams
    }

    pub fn on_request_failed(&self) {
        self.link.lock().unwrap().request_failed(self.now_ms());
    }

    pub fn on_request_succeeded(&self) {
        self.link.lock().unwrap().request_succeeded();
    }

    pub fn retry_due(&self) -> bool {
        self.link.lock().unwrap().retry_due(self.now_ms())
    }

    /// Periodic poll, independent of a fresh heartbeat, to age the link
    /// state toward Degraded/Disconnected.
    pub fn poll_link(&self) -> LinkState {
        let state = self.link.lock().unwrap().poll(self.now_ms());
        let _ = self.link_state_tx.send(state);
        state
    }

    pub fn link_state(&self) -> LinkState {
        *self.link_state_tx.borrow()
    }

    pub fn set_gnss(&self, gnss: GnssSnapshot) {
        let _ = self.gnss_tx.send(Some(gnss));
    }

    pub fn set_attitude(&self, attitude: AttitudeSnapshot) {
        let _ = self.attitude_tx.send(Some(attitude));
    }

    pub fn set_global_position(&self, position: GlobalPositionSnapshot) {
        let _ = self.position_tx.send(Some(position));
    }

    pub fn on_waypoint_reached(&self, index: u16) {
        self.waypoints.lock().unwrap().on_reached(index);
        let _ = self.waypoint_tx.send(Some(index));
    }

    pub fn reached_waypoint_index(&self) -> Option<u16> {
        self.waypoints.lock().unwrap().reached_index()
    }

    /// A fresh receiver for `WaitVehicleWaypoint`-style awaits.
    pub fn subscribe_waypoints(&self) -> watch::Receiver<Option<u16>> {
        self.waypoint_tx.subscribe()
    }

    /// The current frame `ReadData` composes a page from.
    pub fn frame(&self) -> TelemetryFrame {
        TelemetryFrame {
            gnss: *self.gnss_tx.borrow(),
            attitude: *self.attitude_tx.borrow(),
            global_position: *self.position_tx.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_zero_fills_until_first_packet() {
        let source = TelemetrySource::new(10_000);
        let frame = source.frame();
        assert!(frame.gnss.is_none());
        assert_eq!(frame.gnss_or_zero().fix_type, sdr_core::GnssFixType::NoGps);
    }

    #[test]
    fn set_and_read_latest_snapshot() {
        let source = TelemetrySource::new(10_000);
        source.set_attitude(AttitudeSnapshot { roll: 0.1, pitch: 0.2, yaw: 0.3 });
        assert_eq!(source.frame().attitude, Some(AttitudeSnapshot { roll: 0.1, pitch: 0.2, yaw: 0.3 }));
    }

    #[tokio::test]
    async fn waypoint_subscriber_observes_update() {
        let source = TelemetrySource::new(10_000);
        let mut rx = source.subscribe_waypoints();
        source.on_waypoint_reached(3);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(3));
        assert_eq!(source.reached_waypoint_index(), Some(3));
    }
}
