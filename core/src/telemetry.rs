//! Telemetry Source link-state machine. Pure: the
//! server crate's MAVLink link feeds heartbeat/packet timestamps in and
//! reacts to the transitions this type reports. Modeled after
//! `core::connection::ConnectionManager`'s explicit-clock discipline.

/// Three-state link indicator driven by heartbeat frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Degraded,
    Disconnected,
}

/// What the caller must do after feeding in a new point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkPoll {
    pub state: LinkState,
    /// Fires exactly once per Disconnected->Connected transition while a
    /// request is pending; the caller should send one data-stream request.
    pub should_request_streams: bool,
}

/// Tracks the three-state link indicator and the coalesced
/// data-stream-request retry flag.
#[derive(Debug)]
pub struct TelemetryLink {
    device_timeout_ms: u64,
    last_heartbeat_at_ms: Option<u64>,
    state: LinkState,
    /// Set whenever a stream request is owed to the autopilot: initially
    /// (nothing requested yet) and again after a failed send.
    request_pending: bool,
    retry_at_ms: Option<u64>,
}

/// Retry delay for a failed data-stream request.
pub const REQUEST_RETRY_DELAY_MS: u64 = 5;

impl TelemetryLink {
    pub fn new(device_timeout_ms: u64) -> Self {
        TelemetryLink {
            device_timeout_ms,
            last_heartbeat_at_ms: None,
            state: LinkState::Disconnected,
            request_pending: true,
            retry_at_ms: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Feed in a received heartbeat; recomputes link state and reports
    /// whether a stream request should be (re)sent now.
    pub fn on_heartbeat(&mut self, now_ms: u64) -> LinkPoll {
        let previous = self.state;
        self.last_heartbeat_at_ms = Some(now_ms);
        self.state = LinkState::Connected;

        let should_request = previous != LinkState::Connected && self.request_pending;
        LinkPoll {
            state: self.state,
            should_request_streams: should_request,
        }
    }

    /// Recompute link state purely from elapsed time, without a fresh
    /// heartbeat (call periodically from the server's poll loop).
    pub fn poll(&mut self, now_ms: u64) -> LinkState {
        self.state = match self.last_heartbeat_at_ms {
            None => LinkState::Disconnected,
            Some(last) => {
                let elapsed = now_ms.saturating_sub(last);
                if elapsed <= self.device_timeout_ms {
                    LinkState::Connected
                } else if elapsed <= self.device_timeout_ms * 2 {
                    LinkState::Degraded
                } else {
                    LinkState::Disconnected
                }
            }
        };
        self.state
    }

    /// Send failed: schedule exactly one retry after `REQUEST_RETRY_DELAY_MS`,
    /// coalescing with any already-pending request.
    pub fn request_failed(&mut self, now_ms: u64) {
        self.request_pending = true;
        self.retry_at_ms = Some(now_ms + REQUEST_RETRY_DELAY_MS);
    }

    pub fn request_succeeded(&mut self) {
        self.request_pending = false;
        self.retry_at_ms = None;
    }

    /// Whether a scheduled retry is due at `now_ms`.
    pub fn retry_due(&self, now_ms: u64) -> bool {
        matches!(self.retry_at_ms, Some(at) if now_ms >= at)
    }
}

/// Tracks the "last reached waypoint index" observable, fed from autopilot
/// mission-item-reached events.
#[derive(Debug, Default)]
pub struct WaypointTracker {
    reached: Option<u16>,
}

impl WaypointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_reached(&mut self, index: u16) {
        self.reached = Some(index);
    }

    pub fn reached_index(&self) -> Option<u16> {
        self.reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected_with_pending_request() {
        let link = TelemetryLink::new(10_000);
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[test]
    fn first_heartbeat_connects_and_requests_streams() {
        let mut link = TelemetryLink::new(10_000);
        let poll = link.on_heartbeat(0);
        assert_eq!(poll.state, LinkState::Connected);
        assert!(poll.should_request_streams);
    }

    #[test]
    fn repeated_heartbeats_while_connected_do_not_rerequest() {
        let mut link = TelemetryLink::new(10_000);
        link.on_heartbeat(0);
        link.request_succeeded();
        let poll = link.on_heartbeat(100);
        assert!(!poll.should_request_streams);
    }

    #[test]
    fn reconnect_after_disconnect_requests_again() {
        let mut link = TelemetryLink::new(1_000);
        link.on_heartbeat(0);
        link.request_succeeded();
        link.poll(5_000); // now well past 2x timeout -> Disconnected
        assert_eq!(link.state(), LinkState::Disconnected);
        // a fresh loss of link re-arms the request flag from the transport layer
        link.request_failed(5_000);
        let poll = link.on_heartbeat(5_100);
        assert!(poll.should_request_streams);
    }

    #[test]
    fn degraded_between_one_and_two_timeouts() {
        let mut link = TelemetryLink::new(1_000);
        link.on_heartbeat(0);
        assert_eq!(link.poll(1_500), LinkState::Degraded);
        assert_eq!(link.poll(3_000), LinkState::Disconnected);
    }

    #[test]
    fn retry_due_after_delay() {
        let mut link = TelemetryLink::new(1_000);
        link.request_failed(100);
        assert!(!link.retry_due(101));
        assert!(link.retry_due(105));
    }

    #[test]
    fn waypoint_tracker_reports_latest() {
        let mut tracker = WaypointTracker::new();
        assert_eq!(tracker.reached_index(), None);
        tracker.on_reached(3);
        assert_eq!(tracker.reached_index(), Some(3));
    }
}
