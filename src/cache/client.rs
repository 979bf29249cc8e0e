//! Cache-handle client interface (component C9) — contract only. The
//! cache storage engine itself is out of scope; this module
//! defines the narrow async boundary the cache-arbitration FSM (C5) talks
//! through, the way `hyper`'s `Connect`/`Accept` traits define a boundary
//! to a collaborator hyper itself doesn't implement.

use async_trait::async_trait;

use crate::cache::key::CacheKey;
use crate::error::{CacheErrorKind, Error, Result};

/// A single-use, at-most-one-in-flight-operation read handle.
pub struct ReadHandle(Box<dyn ReadOps>);

/// A single-use, at-most-one-in-flight-operation write handle.
pub struct WriteHandle(Box<dyn WriteOps>);

/// What a concrete cache backend's read side must provide; a real
/// implementation (out of scope here, see the module docs) hands a
/// `Box<dyn ReadOps>` to [`ReadHandle::new`] the same way the in-tree
/// test fakes do.
#[async_trait]
pub trait ReadOps: Send {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    async fn close(&mut self) -> Result<()>;
}

/// Write-side counterpart of [`ReadOps`].
#[async_trait]
pub trait WriteOps: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;
    async fn close(&mut self) -> Result<()>;
}

impl ReadHandle {
    pub fn new(ops: impl ReadOps + 'static) -> ReadHandle {
        ReadHandle(Box::new(ops))
    }

    /// Reads into `buf`. `Ok(0)` means EOF per the handle contract.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.0.read(buf).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.0.close().await
    }
}

impl WriteHandle {
    pub fn new(ops: impl WriteOps + 'static) -> WriteHandle {
        WriteHandle(Box::new(ops))
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.0.write(buf).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.0.close().await
    }
}

/// Narrow async boundary to the external cache subsystem.
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn open_read(&self, key: &CacheKey, skip_bytes: u64) -> Result<ReadHandle>;
    async fn open_write(&self, key: &CacheKey, truncate: bool) -> Result<WriteHandle>;
    /// Synchronous predicate: does the cache currently permit an operation
    /// on this key? Used by the arbitration FSM before even attempting an
    /// open, to avoid a round trip it already knows will fail.
    fn rw_op_allowed(&self, key: &CacheKey, skip_bytes: u64) -> bool;
}

/// A `CacheClient` that never has anything cached and accepts (and
/// discards) every write. Useful as a default collaborator in
/// configurations that run without a cache subsystem attached, and in
/// integration tests that only exercise the miss/write path.
pub struct NullCacheClient;

struct NullRead;
struct NullWrite;

#[async_trait]
impl ReadOps for NullRead {
    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl WriteOps for NullWrite {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(buf.len())
    }
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl CacheClient for NullCacheClient {
    async fn open_read(&self, _key: &CacheKey, _skip_bytes: u64) -> Result<ReadHandle> {
        Err(Error::new_cache(CacheErrorKind::ObjectNotPresent))
    }
    async fn open_write(&self, _key: &CacheKey, _truncate: bool) -> Result<WriteHandle> {
        Ok(WriteHandle::new(NullWrite))
    }
    fn rw_op_allowed(&self, _key: &CacheKey, _skip_bytes: u64) -> bool {
        true
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// An in-memory cache fake keyed by URL, for FSM and handler tests.
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
}
