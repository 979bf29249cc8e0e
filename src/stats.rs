//! Per-worker statistics: plain counters summed by the
//! management RPC across workers, not shared atomics — each worker owns
//! its own `VarStats`/`RespSizeStats` and only the management task ever
//! sees them combined.

/// Transaction/outcome counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct VarStats {
    pub requests_total: u64,
    pub cache_hit: u64,
    pub cache_miss: u64,
    pub cache_csum_miss: u64,
    pub blind_tunnel: u64,
    pub done_error: u64,
    pub done_unsupported: u64,
    pub server_talks_first: u64,
}

impl VarStats {
    pub fn merge(&mut self, other: &VarStats) {
        self.requests_total += other.requests_total;
        self.cache_hit += other.cache_hit;
        self.cache_miss += other.cache_miss;
        self.cache_csum_miss += other.cache_csum_miss;
        self.blind_tunnel += other.blind_tunnel;
        self.done_error += other.done_error;
        self.done_unsupported += other.done_unsupported;
        self.server_talks_first += other.server_talks_first;
    }
}

/// Header-length buckets, 0.5 KiB steps up to 8 KiB (17 buckets incl. the
/// overflow bucket).
const HDR_LEN_BUCKETS: usize = 17;
const HDR_LEN_STEP: u64 = 512;

/// Total-length buckets, expressed as percent-of-header-length steps:
/// 0%, 30%, 40%, 50%, 75%, and an overflow bucket (6 buckets).
const TOTAL_LEN_BUCKETS: usize = 6;
const TOTAL_LEN_PCT_STEPS: [u64; TOTAL_LEN_BUCKETS - 1] = [0, 30, 40, 50, 75];

/// A 17x6 histogram of response header-length vs. total-length.
#[derive(Debug, Clone, Copy)]
pub struct RespSizeStats {
    buckets: [[u64; TOTAL_LEN_BUCKETS]; HDR_LEN_BUCKETS],
}

impl Default for RespSizeStats {
    fn default() -> RespSizeStats {
        RespSizeStats {
            buckets: [[0; TOTAL_LEN_BUCKETS]; HDR_LEN_BUCKETS],
        }
    }
}

impl RespSizeStats {
    fn hdr_bucket(hdr_bytes: u64) -> usize {
        ((hdr_bytes / HDR_LEN_STEP) as usize).min(HDR_LEN_BUCKETS - 1)
    }

    fn total_bucket(hdr_bytes: u64, total_bytes: u64) -> usize {
        if hdr_bytes == 0 {
            return 0;
        }
        let pct = total_bytes.saturating_sub(hdr_bytes) * 100 / hdr_bytes;
        TOTAL_LEN_PCT_STEPS
            .iter()
            .rposition(|&step| pct >= step)
            .map(|i| i + 1)
            .unwrap_or(0)
            .min(TOTAL_LEN_BUCKETS - 1)
    }

    pub fn record(&mut self, hdr_bytes: u64, total_bytes: u64) {
        let h = Self::hdr_bucket(hdr_bytes);
        let t = Self::total_bucket(hdr_bytes, total_bytes);
        self.buckets[h][t] += 1;
    }

    pub fn merge(&mut self, other: &RespSizeStats) {
        for h in 0..HDR_LEN_BUCKETS {
            for t in 0..TOTAL_LEN_BUCKETS {
                self.buckets[h][t] += other.buckets[h][t];
            }
        }
    }

    pub fn buckets(&self) -> &[[u64; TOTAL_LEN_BUCKETS]; HDR_LEN_BUCKETS] {
        &self.buckets
    }
}

/// Network-level counters feeding `summary_net_stats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetStats {
    pub connections_accepted: u64,
    pub bytes_from_client: u64,
    pub bytes_to_client: u64,
    pub bytes_from_origin: u64,
    pub bytes_to_origin: u64,
}

impl NetStats {
    pub fn merge(&mut self, other: &NetStats) {
        self.connections_accepted += other.connections_accepted;
        self.bytes_from_client += other.bytes_from_client;
        self.bytes_to_client += other.bytes_to_client;
        self.bytes_from_origin += other.bytes_from_origin;
        self.bytes_to_origin += other.bytes_to_origin;
    }
}

/// Cache-arbitration counters feeding `summary_cache_stats` /
/// `detailed_cache_stats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub bpctrl_entries: u64,
    pub compare_skip: u64,
    pub compare_ok: u64,
    pub compare_fail: u64,
    pub bytes_compared: u64,
}

impl CacheStats {
    pub fn merge(&mut self, other: &CacheStats) {
        self.bpctrl_entries += other.bpctrl_entries;
        self.compare_skip += other.compare_skip;
        self.compare_ok += other.compare_ok;
        self.compare_fail += other.compare_fail;
        self.bytes_compared += other.bytes_compared;
    }
}

/// Everything one worker reports to a management-RPC snapshot request.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerSnapshot {
    pub var: VarStats,
    pub resp_size: RespSizeStats,
    pub net: NetStats,
    pub cache: CacheStats,
}

impl WorkerSnapshot {
    pub fn merge(&mut self, other: &WorkerSnapshot) {
        self.var.merge(&other.var);
        self.resp_size.merge(&other.resp_size);
        self.net.merge(&other.net);
        self.cache.merge(&other.cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resp_size_bucket_boundaries() {
        assert_eq!(RespSizeStats::hdr_bucket(0), 0);
        assert_eq!(RespSizeStats::hdr_bucket(HDR_LEN_STEP), 1);
        assert_eq!(RespSizeStats::hdr_bucket(100 * HDR_LEN_STEP), HDR_LEN_BUCKETS - 1);
    }

    #[test]
    fn merge_sums_every_field() {
        let mut a = WorkerSnapshot::default();
        let mut b = WorkerSnapshot::default();
        a.var.requests_total = 3;
        b.var.requests_total = 4;
        a.resp_size.record(100, 150);
        b.resp_size.record(100, 150);
        a.merge(&b);
        assert_eq!(a.var.requests_total, 7);
        assert_eq!(a.resp_size.buckets()[0].iter().sum::<u64>(), 2);
    }
}
