//! Proxy-connection FSM (C6) and the HTTP handler that drives it (C7).

pub mod fsm;
pub mod handler;

pub use fsm::{ConnFsm, Leg, RecvState, SendState, ShutdownState};
pub use handler::ConnectionHandler;
