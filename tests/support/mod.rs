#![allow(dead_code)]
//! Shared harness for the end-to-end tests, in the style of hyper's own
//! `tests/support/mod.rs`: a loopback TCP pair so the handler can own real
//! split halves, and an in-memory `CacheClient` fake standing in for the
//! out-of-scope cache storage engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cacherelay::cache::client::{CacheClient, ReadHandle, ReadOps, WriteHandle, WriteOps};
use cacherelay::cache::CacheKey;
use cacherelay::error::{CacheErrorKind, Error, Result};
use tokio::net::{TcpListener, TcpStream};

/// Spins up loopback TCP listeners so a test can hand the handler real,
/// owned `TcpStream` halves on both legs.
pub async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr);
    let (accept_res, connect_res) = tokio::join!(listener.accept(), connect);
    (accept_res.unwrap().0, connect_res.unwrap())
}

struct MemRead {
    data: Vec<u8>,
    pos: usize,
}

#[async_trait]
impl ReadOps for MemRead {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = (self.data.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MemWrite {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    url: String,
    buf: Vec<u8>,
}

#[async_trait]
impl WriteOps for MemWrite {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }
    async fn close(&mut self) -> Result<()> {
        self.objects.lock().unwrap().insert(self.url.clone(), self.buf.clone());
        Ok(())
    }
}

/// An in-memory cache fake keyed by URL, mirroring the crate's own
/// unit-test fake but built against the public `CacheClient` boundary so
/// it can live out here in `tests/`.
#[derive(Default, Clone)]
pub struct MemoryCacheClient {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryCacheClient {
    pub fn new() -> MemoryCacheClient {
        MemoryCacheClient {
            objects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn seed(&self, url: &str, bytes: &[u8]) {
        self.objects.lock().unwrap().insert(url.to_string(), bytes.to_vec());
    }

    pub fn stored(&self, url: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(url).cloned()
    }
}

#[async_trait]
impl CacheClient for MemoryCacheClient {
    async fn open_read(&self, key: &CacheKey, skip_bytes: u64) -> Result<ReadHandle> {
        let objects = self.objects.lock().unwrap();
        match objects.get(&key.url) {
            Some(bytes) => Ok(ReadHandle::new(MemRead {
                data: bytes[(skip_bytes as usize).min(bytes.len())..].to_vec(),
                pos: 0,
            })),
            None => Err(Error::new_cache(CacheErrorKind::ObjectNotPresent)),
        }
    }

    async fn open_write(&self, key: &CacheKey, truncate: bool) -> Result<WriteHandle> {
        if truncate {
            self.objects.lock().unwrap().remove(&key.url);
        }
        Ok(WriteHandle::new(MemWrite {
            objects: self.objects.clone(),
            url: key.url.clone(),
            buf: Vec::new(),
        }))
    }

    fn rw_op_allowed(&self, _key: &CacheKey, _skip_bytes: u64) -> bool {
        true
    }
}
