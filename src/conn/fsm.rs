//! Proxy-connection FSM (component C6): the client-leg and
//! origin-leg receive/send axes, shutdown coordination between them, and
//! the half-closed stall sweep. Kept synchronous and side-effect-free like
//! the cache FSM — the handler (C7) is the only thing that performs
//! real I/O, driven by the states and guards here.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Client,
    Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Start,
    Connecting,
    Idle,
    Reading,
    Eof,
    Err,
    /// Only reachable on the origin leg, via `pause_origin_recv`.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Start,
    Connecting,
    Idle,
    Sending,
    Err,
}

/// A leg's shutdown sits in `WaitEnd` until a shutdown-send or close
/// is actually requested, and even then may stay deferred while the other
/// leg still has buffered bytes this leg hasn't sent yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Open,
    WaitEnd,
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct LegState {
    recv: RecvState,
    send: SendState,
    shutdown: ShutdownState,
    /// Cumulative bytes received, sampled once per sweep tick to detect a
    /// stalled leg.
    recv_count: u64,
    recv_count_at_last_sweep: u64,
}

impl LegState {
    fn new(is_origin: bool) -> LegState {
        LegState {
            recv: if is_origin { RecvState::Start } else { RecvState::Idle },
            send: if is_origin { SendState::Start } else { SendState::Idle },
            shutdown: ShutdownState::Open,
            recv_count: 0,
            recv_count_at_last_sweep: 0,
        }
    }
}

pub struct ConnFsm {
    client: LegState,
    origin: LegState,
    blind_tunnel: bool,
}

impl ConnFsm {
    pub fn new() -> ConnFsm {
        ConnFsm {
            client: LegState::new(false),
            origin: LegState::new(true),
            blind_tunnel: false,
        }
    }

    fn leg(&self, leg: Leg) -> &LegState {
        match leg {
            Leg::Client => &self.client,
            Leg::Origin => &self.origin,
        }
    }

    fn leg_mut(&mut self, leg: Leg) -> &mut LegState {
        match leg {
            Leg::Client => &mut self.client,
            Leg::Origin => &mut self.origin,
        }
    }

    pub fn recv_state(&self, leg: Leg) -> RecvState {
        self.leg(leg).recv
    }

    pub fn send_state(&self, leg: Leg) -> SendState {
        self.leg(leg).send
    }

    pub fn is_blind_tunnel(&self) -> bool {
        self.blind_tunnel
    }

    /// Origin receive window must be at least half a block, and the
    /// client leg must still be open.
    pub fn org_recv_allowed(&self, window: usize, half_block: usize, client_open: bool) -> bool {
        window >= half_block && client_open && self.origin.recv != RecvState::Paused
    }

    pub fn cln_recv_allowed(&self, window: usize, half_block: usize, origin_open: bool) -> bool {
        window >= half_block && origin_open
    }

    /// Origin sends only happen over the real TCP form; once switched to a
    /// cache-backed reader there is nothing to send (we're only a source).
    pub fn org_send_allowed(&self, pending: usize, is_tcp_form: bool) -> bool {
        pending > 0 && is_tcp_form
    }

    pub fn cln_send_allowed(&self, pending: usize) -> bool {
        pending > 0
    }

    pub fn start_connecting(&mut self, leg: Leg) {
        let l = self.leg_mut(leg);
        l.recv = RecvState::Connecting;
        l.send = SendState::Connecting;
    }

    pub fn connected(&mut self, leg: Leg) {
        let l = self.leg_mut(leg);
        l.recv = RecvState::Idle;
        l.send = SendState::Idle;
    }

    pub fn begin_read(&mut self, leg: Leg) {
        self.leg_mut(leg).recv = RecvState::Reading;
    }

    pub fn recv_data(&mut self, leg: Leg, n: usize) {
        let l = self.leg_mut(leg);
        l.recv = RecvState::Idle;
        l.recv_count += n as u64;
    }

    pub fn recv_eof(&mut self, leg: Leg) {
        self.leg_mut(leg).recv = RecvState::Eof;
    }

    pub fn recv_err(&mut self, leg: Leg) {
        self.leg_mut(leg).recv = RecvState::Err;
    }

    /// Only valid on the origin leg.
    pub fn pause_origin_recv(&mut self) {
        self.origin.recv = RecvState::Paused;
    }

    pub fn resume_origin_recv(&mut self) {
        if self.origin.recv == RecvState::Paused {
            self.origin.recv = RecvState::Idle;
        }
    }

    pub fn begin_send(&mut self, leg: Leg) {
        self.leg_mut(leg).send = SendState::Sending;
    }

    pub fn send_done(&mut self, leg: Leg) {
        self.leg_mut(leg).send = SendState::Idle;
    }

    pub fn send_err(&mut self, leg: Leg) {
        self.leg_mut(leg).send = SendState::Err;
    }

    /// Requests a shutdown-send on `leg`. Deferred (stays `WaitEnd`,
    /// returns `false`) while `cross_leg_reader_nonempty` — the opposite
    /// leg still has bytes this leg hasn't forwarded.
    pub fn request_shutdown_send(&mut self, leg: Leg, cross_leg_reader_nonempty: bool) -> bool {
        let l = self.leg_mut(leg);
        if cross_leg_reader_nonempty {
            l.shutdown = ShutdownState::WaitEnd;
            false
        } else {
            l.shutdown = ShutdownState::Closed;
            true
        }
    }

    pub fn request_close(&mut self, leg: Leg, cross_leg_reader_nonempty: bool) -> bool {
        self.request_shutdown_send(leg, cross_leg_reader_nonempty)
    }

    /// Retries a deferred shutdown once the cross-leg reader has drained.
    pub fn retry_deferred_shutdown(&mut self, leg: Leg, cross_leg_reader_nonempty: bool) -> bool {
        if self.leg(leg).shutdown == ShutdownState::WaitEnd {
            self.request_shutdown_send(leg, cross_leg_reader_nonempty)
        } else {
            self.leg(leg).shutdown == ShutdownState::Closed
        }
    }

    pub fn shutdown_state(&self, leg: Leg) -> ShutdownState {
        self.leg(leg).shutdown
    }

    /// The protocol handler is torn down and bytes flow directly
    /// between legs from here on.
    pub fn engage_blind_tunnel(&mut self) {
        self.blind_tunnel = true;
        self.resume_origin_recv();
    }

    /// Called once per sweep interval (default 60s). Returns the legs
    /// that have been stalled (no new received bytes) since the previous
    /// sweep and are also already in an error/eof state on that axis.
    pub fn sweep_tick(&mut self) -> bool {
        let client_stalled = self.client.recv_count == self.client.recv_count_at_last_sweep
            && matches!(self.client.recv, RecvState::Err | RecvState::Eof);
        let origin_stalled = self.origin.recv_count == self.origin.recv_count_at_last_sweep
            && matches!(self.origin.recv, RecvState::Err | RecvState::Eof);
        self.client.recv_count_at_last_sweep = self.client.recv_count;
        self.origin.recv_count_at_last_sweep = self.origin.recv_count;
        client_stalled || origin_stalled
    }
}

impl Default for ConnFsm {
    fn default() -> ConnFsm {
        ConnFsm::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_leg_starts_connecting_client_starts_idle() {
        let fsm = ConnFsm::new();
        assert_eq!(fsm.recv_state(Leg::Origin), RecvState::Start);
        assert_eq!(fsm.recv_state(Leg::Client), RecvState::Idle);
    }

    #[test]
    fn pause_and_resume_origin_recv() {
        let mut fsm = ConnFsm::new();
        fsm.connected(Leg::Origin);
        fsm.pause_origin_recv();
        assert_eq!(fsm.recv_state(Leg::Origin), RecvState::Paused);
        assert!(!fsm.org_recv_allowed(4096, 2048, true));
        fsm.resume_origin_recv();
        assert_eq!(fsm.recv_state(Leg::Origin), RecvState::Idle);
    }

    #[test]
    fn shutdown_send_deferred_while_cross_leg_has_data() {
        let mut fsm = ConnFsm::new();
        assert!(!fsm.request_shutdown_send(Leg::Client, true));
        assert_eq!(fsm.shutdown_state(Leg::Client), ShutdownState::WaitEnd);
        assert!(fsm.retry_deferred_shutdown(Leg::Client, false));
        assert_eq!(fsm.shutdown_state(Leg::Client), ShutdownState::Closed);
    }

    #[test]
    fn sweep_detects_stalled_errored_leg() {
        let mut fsm = ConnFsm::new();
        fsm.recv_err(Leg::Origin);
        assert!(fsm.sweep_tick());
        // Second tick with no further movement still reports stalled.
        assert!(fsm.sweep_tick());
    }
}
