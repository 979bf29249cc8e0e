//! Cache arbitration (C5) and the cache-handle client boundary (C9).

pub mod client;
pub mod fsm;
pub mod key;

pub use client::{CacheClient, NullCacheClient, ReadHandle, WriteHandle};
pub use fsm::{CacheFsm, Event as CacheEvent, State as CacheState};
pub use key::CacheKey;
