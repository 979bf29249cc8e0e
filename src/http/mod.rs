//! HTTP message parsing (C3) and the per-transaction state machine (C4).

pub mod parser;
pub mod transaction;

pub use parser::{Action as ParserAction, MessageParser, ParserEvents, ParserKind};
pub use transaction::{CacheControl, Transaction, TxnFlags};
