//! Cache-arbitration state machine (component C5).
//!
//! Expressed as a transition table: states
//! and events in, an action for the handler (C7) to actually perform —
//! opening/reading/writing the cache handle, switching the origin stream —
//! out. Keeping the FSM itself synchronous and side-effect-free makes the
//! transition table exhaustively testable without an async runtime; the
//! handler interprets each `Action` and drives the real `CacheClient` calls.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    WaitBodyData,
    CacheOpenRd,
    CacheCompare,
    CacheOpenWr,
    CacheRead,
    CacheWrite,
    CacheIdleWr,
    CacheClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    OriginData,
    SkipTrans,
    TransCompleted,
    TryBlindTunnel,
    CacheOpDone,
    CacheOpErr,
    CompareOk,
    CompareFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do beyond the state change already recorded.
    None,
    OpenRead,
    OpenWriteTruncate,
    OpenWriteNoTruncate,
    DoCompare,
    SwitchToCache,
    Write,
    CloseAndNextTransaction,
    CloseAndStartTunnel,
    ConsumeAndDrain,
}

/// Guards the FSM itself cannot evaluate (they depend on buffer contents
/// and the transaction), supplied by the caller at each event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Guards {
    pub has_cache_wr_data: bool,
    pub has_cache_key: bool,
    pub cache_permits: bool,
    pub can_write_on_miss: bool,
}

pub struct CacheFsm {
    state: State,
    pend_blind_tunnel: bool,
}

impl CacheFsm {
    pub fn new() -> CacheFsm {
        CacheFsm {
            state: State::WaitBodyData,
            pend_blind_tunnel: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn pend_blind_tunnel(&self) -> bool {
        self.pend_blind_tunnel
    }

    /// Resets to the initial state for the next pipelined transaction
    /// (`trans_completed` in `cache_idle_wr`).
    pub fn start_next_transaction(&mut self) {
        self.state = State::WaitBodyData;
        self.pend_blind_tunnel = false;
    }

    pub fn handle(&mut self, ev: Event, g: Guards) -> Action {
        use Event::*;
        use State::*;

        if ev == TryBlindTunnel {
            return match self.state {
                // The origin stream has already been handed off to the
                // cache; start the tunnel immediately.
                CacheRead => {
                    self.state = CacheClosed;
                    Action::CloseAndStartTunnel
                }
                // No cache operation in flight: nothing to wait for.
                WaitBodyData | CacheClosed => {
                    self.state = CacheClosed;
                    Action::CloseAndStartTunnel
                }
                _ => {
                    self.pend_blind_tunnel = true;
                    Action::None
                }
            };
        }

        match (self.state, ev) {
            (WaitBodyData, OriginData) => {
                if g.has_cache_key && g.cache_permits {
                    self.state = CacheOpenRd;
                    Action::OpenRead
                } else {
                    Action::None
                }
            }
            (WaitBodyData, SkipTrans) => Action::None,

            (CacheOpenRd, CacheOpDone) => {
                if self.take_pending_tunnel() {
                    Action::CloseAndStartTunnel
                } else {
                    self.state = CacheCompare;
                    Action::DoCompare
                }
            }
            (CacheOpenRd, CacheOpErr) => {
                if self.take_pending_tunnel() {
                    Action::CloseAndStartTunnel
                } else if g.can_write_on_miss {
                    self.state = CacheOpenWr;
                    Action::OpenWriteNoTruncate
                } else {
                    self.state = CacheClosed;
                    Action::ConsumeAndDrain
                }
            }

            (CacheCompare, CompareOk) => {
                self.state = CacheRead;
                Action::SwitchToCache
            }
            (CacheCompare, CompareFail) => {
                self.state = CacheOpenWr;
                Action::OpenWriteTruncate
            }

            (CacheOpenWr, CacheOpDone) | (CacheWrite, CacheOpDone) => {
                if self.take_pending_tunnel() {
                    Action::CloseAndStartTunnel
                } else if g.has_cache_wr_data {
                    self.state = CacheWrite;
                    Action::Write
                } else {
                    self.state = CacheIdleWr;
                    Action::None
                }
            }

            (CacheIdleWr, OriginData) => {
                if g.has_cache_wr_data {
                    self.state = CacheWrite;
                    Action::Write
                } else {
                    Action::None
                }
            }
            (CacheIdleWr, TransCompleted) => {
                self.state = CacheClosed;
                Action::CloseAndNextTransaction
            }

            (CacheRead, TransCompleted) => {
                self.state = CacheClosed;
                Action::CloseAndNextTransaction
            }

            (CacheClosed, OriginData) | (CacheClosed, TransCompleted) => Action::ConsumeAndDrain,

            // Any in-flight cache operation can fail.
            (_, CacheOpErr) => {
                self.state = CacheClosed;
                Action::ConsumeAndDrain
            }

            _ => Action::None,
        }
    }

    fn take_pending_tunnel(&mut self) -> bool {
        if self.pend_blind_tunnel {
            self.pend_blind_tunnel = false;
            self.state = State::CacheClosed;
            true
        } else {
            false
        }
    }
}

impl Default for CacheFsm {
    fn default() -> CacheFsm {
        CacheFsm::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guards_miss_writable() -> Guards {
        Guards {
            has_cache_key: true,
            cache_permits: true,
            can_write_on_miss: true,
            ..Default::default()
        }
    }

    #[test]
    fn plain_miss_opens_write_then_closes() {
        let mut f = CacheFsm::new();
        assert_eq!(f.handle(Event::OriginData, guards_miss_writable()), Action::OpenRead);
        assert_eq!(f.state(), State::CacheOpenRd);
        assert_eq!(f.handle(Event::CacheOpErr, guards_miss_writable()), Action::OpenWriteNoTruncate);
        assert_eq!(f.state(), State::CacheOpenWr);
        let mut g = guards_miss_writable();
        g.has_cache_wr_data = true;
        assert_eq!(f.handle(Event::CacheOpDone, g), Action::Write);
        assert_eq!(f.state(), State::CacheWrite);
        g.has_cache_wr_data = false;
        assert_eq!(f.handle(Event::CacheOpDone, g), Action::None);
        assert_eq!(f.state(), State::CacheIdleWr);
        assert_eq!(f.handle(Event::TransCompleted, g), Action::CloseAndNextTransaction);
    }

    #[test]
    fn checksum_match_switches_to_cache_read() {
        let mut f = CacheFsm::new();
        f.handle(Event::OriginData, guards_miss_writable());
        f.handle(Event::CacheOpDone, guards_miss_writable());
        assert_eq!(f.state(), State::CacheCompare);
        assert_eq!(f.handle(Event::CompareOk, guards_miss_writable()), Action::SwitchToCache);
        assert_eq!(f.state(), State::CacheRead);
    }

    #[test]
    fn checksum_mismatch_reopens_write_with_truncate() {
        let mut f = CacheFsm::new();
        f.handle(Event::OriginData, guards_miss_writable());
        f.handle(Event::CacheOpDone, guards_miss_writable());
        assert_eq!(f.handle(Event::CompareFail, guards_miss_writable()), Action::OpenWriteTruncate);
        assert_eq!(f.state(), State::CacheOpenWr);
    }

    #[test]
    fn blind_tunnel_pending_during_open_then_closes_on_completion() {
        let mut f = CacheFsm::new();
        f.handle(Event::OriginData, guards_miss_writable());
        assert_eq!(f.handle(Event::TryBlindTunnel, guards_miss_writable()), Action::None);
        assert!(f.pend_blind_tunnel());
        assert_eq!(
            f.handle(Event::CacheOpDone, guards_miss_writable()),
            Action::CloseAndStartTunnel
        );
        assert_eq!(f.state(), State::CacheClosed);
    }

    #[test]
    fn blind_tunnel_while_reading_from_cache_is_immediate() {
        let mut f = CacheFsm::new();
        f.handle(Event::OriginData, guards_miss_writable());
        f.handle(Event::CacheOpDone, guards_miss_writable());
        f.handle(Event::CompareOk, guards_miss_writable());
        assert_eq!(f.state(), State::CacheRead);
        assert_eq!(
            f.handle(Event::TryBlindTunnel, guards_miss_writable()),
            Action::CloseAndStartTunnel
        );
        assert_eq!(f.state(), State::CacheClosed);
    }
}
