//! `cacherelay`: a transparent HTTP/1.x forward proxy fronting a
//! checksum-verified response cache.
//!
//! The engine is organized the way `hyper`'s `proto::h1` module is: a small
//! buffered-IO layer (`buffer`), a switchable byte source (`stream`), an
//! incremental parser wrapper (`http::parser`) driving a per-message
//! transaction (`http::transaction`), a cache-arbitration state machine
//! (`cache::fsm`) and a per-connection driver (`conn::fsm`) that ties them
//! together. Everything above that (config, logging setup, the management
//! and back-pressure collaborators, worker/acceptor wiring) is ambient
//! scaffolding around the core engine.

pub mod error;

pub mod buffer;
pub mod stream;

pub mod http;
pub mod cache;
pub mod conn;

pub mod backpressure;
pub mod stats;
pub mod management;
pub mod config;
pub mod worker;
pub mod acceptor;
pub mod signals;

pub use error::{Error, Result};
