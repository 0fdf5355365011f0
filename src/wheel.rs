//! Pacing timing wheel.
//!
//! A ring of `B` buckets, each covering a fixed wall-time width `w`
//! (converted to cycles). Outbound data packets are inserted at their
//! precomputed send timestamps; `reap` releases every bucket the clock has
//! crossed into a FIFO ready queue consumed by the transmit stage.
//!
//! Buckets hold singly linked lists drawn from a preallocated node arena,
//! so insertion does not allocate in the steady state.

use std::collections::VecDeque;

use crate::timing::us_to_cycles;

/// A pacer token referencing one packet of one request slot.
///
/// The request number guards against stale entries: a slot may be reused
/// for its next request while old entries are still parked in the wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelEntry {
    /// Local session number.
    pub session_num: u16,
    /// Slot index within the session.
    pub slot_idx: u16,
    /// Packet index within the slot's message.
    pub pkt_idx: u16,
    /// Request number the packet belongs to.
    pub req_num: u64,
}

/// Cycle gap between successive packets at `rate_bps` with packets of
/// `mtu` bytes.
#[inline]
pub fn pkt_gap_cycles(mtu: usize, rate_bps: f64, freq_ghz: f64) -> u64 {
    let sec_per_pkt = mtu as f64 / rate_bps;
    (sec_per_pkt * freq_ghz * 1e9) as u64
}

const NIL: u32 = u32::MAX;

struct Node {
    ent: WheelEntry,
    next: u32,
}

#[derive(Clone, Copy)]
struct Bucket {
    head: u32,
    tail: u32,
}

/// Counters exposed for tuning.
#[derive(Debug, Clone, Copy, Default)]
pub struct WheelStats {
    /// Entries clamped to the furthest bucket because their timestamp was
    /// beyond the horizon.
    pub wheel_too_short: u64,
    /// Total entries inserted.
    pub inserted: u64,
    /// Total entries released to the ready queue.
    pub reaped: u64,
}

/// The timing wheel.
pub struct TimingWheel {
    nodes: Vec<Node>,
    free_head: u32,
    buckets: Vec<Bucket>,
    num_buckets: usize,
    bucket_width_tsc: u64,
    cur_bucket: usize,
    base_tsc: u64,
    ready: VecDeque<WheelEntry>,
    stats: WheelStats,
}

impl TimingWheel {
    /// Create a wheel of `num_buckets` buckets of `bucket_width_us` each,
    /// with an initial arena of `entry_cap` entries.
    pub fn new(num_buckets: usize, bucket_width_us: f64, freq_ghz: f64, entry_cap: usize) -> Self {
        let bucket_width_tsc = us_to_cycles(bucket_width_us, freq_ghz).max(1);
        let entry_cap = entry_cap.max(1);

        let mut nodes = Vec::with_capacity(entry_cap);
        for i in 0..entry_cap {
            let next = if i + 1 < entry_cap { (i + 1) as u32 } else { NIL };
            nodes.push(Node {
                ent: WheelEntry { session_num: 0, slot_idx: 0, pkt_idx: 0, req_num: 0 },
                next,
            });
        }

        Self {
            nodes,
            free_head: 0,
            buckets: vec![Bucket { head: NIL, tail: NIL }; num_buckets],
            num_buckets,
            bucket_width_tsc,
            cur_bucket: 0,
            base_tsc: 0,
            ready: VecDeque::new(),
            stats: WheelStats::default(),
        }
    }

    /// Align bucket 0 to `now`. Must be called before the first insert.
    pub fn reset(&mut self, now: u64) {
        self.base_tsc = now;
    }

    /// Width of one bucket in cycles.
    #[inline]
    pub fn bucket_width_tsc(&self) -> u64 {
        self.bucket_width_tsc
    }

    /// Horizon covered by the wheel in cycles.
    #[inline]
    pub fn horizon_tsc(&self) -> u64 {
        self.bucket_width_tsc * self.num_buckets as u64
    }

    fn alloc_node(&mut self, ent: WheelEntry) -> u32 {
        if self.free_head == NIL {
            // Arena exhausted: double it. Amortized, so the steady state
            // stays allocation-free.
            let old_len = self.nodes.len();
            let new_len = old_len * 2;
            for i in old_len..new_len {
                let next = if i + 1 < new_len { (i + 1) as u32 } else { NIL };
                self.nodes.push(Node {
                    ent: WheelEntry { session_num: 0, slot_idx: 0, pkt_idx: 0, req_num: 0 },
                    next,
                });
            }
            self.free_head = old_len as u32;
        }

        let idx = self.free_head;
        self.free_head = self.nodes[idx as usize].next;
        self.nodes[idx as usize].ent = ent;
        self.nodes[idx as usize].next = NIL;
        idx
    }

    /// Place `ent` in the bucket covering `desired_tsc`.
    ///
    /// Past or current-bucket timestamps land in the current bucket.
    /// Timestamps beyond the horizon clamp to the furthest bucket and bump
    /// the `wheel_too_short` counter.
    pub fn insert(&mut self, ent: WheelEntry, desired_tsc: u64) {
        let mut offset = if desired_tsc <= self.base_tsc {
            0
        } else {
            ((desired_tsc - self.base_tsc) / self.bucket_width_tsc) as usize
        };
        if offset >= self.num_buckets {
            offset = self.num_buckets - 1;
            self.stats.wheel_too_short += 1;
        }

        let bkt_idx = (self.cur_bucket + offset) % self.num_buckets;
        let node = self.alloc_node(ent);

        let bkt = &mut self.buckets[bkt_idx];
        if bkt.tail == NIL {
            bkt.head = node;
            bkt.tail = node;
        } else {
            self.nodes[bkt.tail as usize].next = node;
            bkt.tail = node;
        }
        self.stats.inserted += 1;
    }

    fn drain_bucket(&mut self, bkt_idx: usize) {
        let mut node = self.buckets[bkt_idx].head;
        while node != NIL {
            let next = self.nodes[node as usize].next;
            self.ready.push_back(self.nodes[node as usize].ent);
            self.nodes[node as usize].next = self.free_head;
            self.free_head = node;
            self.stats.reaped += 1;
            node = next;
        }
        self.buckets[bkt_idx] = Bucket { head: NIL, tail: NIL };
    }

    /// Advance the wheel to `now`, draining every crossed bucket into the
    /// ready queue in FIFO order across buckets.
    pub fn reap(&mut self, now: u64) {
        if now < self.base_tsc + self.bucket_width_tsc {
            return;
        }

        let steps = ((now - self.base_tsc) / self.bucket_width_tsc) as usize;
        if steps >= self.num_buckets {
            // Idle gap longer than the horizon: every bucket is due.
            for i in 0..self.num_buckets {
                let bkt_idx = (self.cur_bucket + i) % self.num_buckets;
                self.drain_bucket(bkt_idx);
            }
            self.base_tsc += steps as u64 * self.bucket_width_tsc;
            return;
        }

        for _ in 0..steps {
            self.drain_bucket(self.cur_bucket);
            self.cur_bucket = (self.cur_bucket + 1) % self.num_buckets;
            self.base_tsc += self.bucket_width_tsc;
        }
    }

    /// Pop the next ready entry.
    #[inline]
    pub fn pop_ready(&mut self) -> Option<WheelEntry> {
        self.ready.pop_front()
    }

    /// Number of entries in the ready queue.
    #[inline]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Number of entries still parked in buckets.
    pub fn pending_len(&self) -> usize {
        let mut count = 0;
        for bkt in &self.buckets {
            let mut node = bkt.head;
            while node != NIL {
                count += 1;
                node = self.nodes[node as usize].next;
            }
        }
        count
    }

    /// Counters for tuning.
    #[inline]
    pub fn stats(&self) -> WheelStats {
        self.stats
    }

    #[cfg(test)]
    fn bucket_len(&self, offset: usize) -> usize {
        let bkt_idx = (self.cur_bucket + offset) % self.num_buckets;
        let mut count = 0;
        let mut node = self.buckets[bkt_idx].head;
        while node != NIL {
            count += 1;
            node = self.nodes[node as usize].next;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::{measure_rdtsc_freq, rdtsc, to_sec};

    fn ent(pkt_idx: u16) -> WheelEntry {
        WheelEntry { session_num: 1, slot_idx: 0, pkt_idx, req_num: 0 }
    }

    #[test]
    fn test_wheel_empty_reap() {
        let mut wheel = TimingWheel::new(8, 1.0, 1.0, 16);
        wheel.reset(rdtsc());
        wheel.reap(rdtsc());
        assert_eq!(wheel.ready_len(), 0);
    }

    #[test]
    fn test_wheel_basic() {
        let mut wheel = TimingWheel::new(8, 1.0, 1.0, 16);
        wheel.reset(1000);

        // One entry one bucket out; released once the clock crosses it.
        wheel.insert(ent(0), 1000 + wheel.bucket_width_tsc());
        wheel.reap(1000);
        assert_eq!(wheel.ready_len(), 0);

        wheel.reap(1000 + 2 * wheel.bucket_width_tsc());
        assert_eq!(wheel.ready_len(), 1);
        assert_eq!(wheel.pop_ready(), Some(ent(0)));
    }

    #[test]
    fn test_wheel_past_insert_goes_to_current_bucket() {
        let mut wheel = TimingWheel::new(8, 1.0, 1.0, 16);
        wheel.reset(1_000_000);

        wheel.insert(ent(0), 0);
        assert_eq!(wheel.bucket_len(0), 1);

        wheel.reap(1_000_000 + wheel.bucket_width_tsc());
        assert_eq!(wheel.pop_ready(), Some(ent(0)));
    }

    #[test]
    fn test_wheel_horizon_clamp() {
        let mut wheel = TimingWheel::new(8, 1.0, 1.0, 16);
        wheel.reset(0);

        wheel.insert(ent(0), wheel.horizon_tsc() * 10);
        assert_eq!(wheel.stats().wheel_too_short, 1);
        assert_eq!(wheel.bucket_len(7), 1);

        // The clamped entry still comes out when the furthest bucket is crossed.
        wheel.reap(wheel.horizon_tsc());
        assert_eq!(wheel.ready_len(), 1);
    }

    #[test]
    fn test_wheel_fifo_across_buckets() {
        let mut wheel = TimingWheel::new(8, 1.0, 1.0, 16);
        wheel.reset(0);
        let w = wheel.bucket_width_tsc();

        // Two entries in bucket 1, one in bucket 0, one in bucket 2.
        wheel.insert(ent(10), w);
        wheel.insert(ent(11), w);
        wheel.insert(ent(0), 0);
        wheel.insert(ent(20), 2 * w);

        wheel.reap(3 * w);
        let order: Vec<u16> = std::iter::from_fn(|| wheel.pop_ready().map(|e| e.pkt_idx)).collect();
        assert_eq!(order, vec![0, 10, 11, 20]);
    }

    #[test]
    fn test_wheel_crossed_buckets_are_empty() {
        let mut wheel = TimingWheel::new(16, 1.0, 1.0, 64);
        wheel.reset(0);
        let w = wheel.bucket_width_tsc();

        for i in 0..32u16 {
            wheel.insert(ent(i), (i as u64 % 12) * w);
        }

        wheel.reap(6 * w);
        // Every entry is either released or still ahead of the clock.
        assert_eq!(wheel.ready_len() + wheel.pending_len(), 32);
        for offset in 0..16 {
            if offset >= 6 {
                continue;
            }
            // Crossed buckets sit num_buckets - steps behind the cursor now.
            let behind = wheel.num_buckets - 6 + offset;
            assert_eq!(wheel.bucket_len(behind), 0, "crossed bucket {offset} not drained");
        }
    }

    #[test]
    fn test_wheel_long_idle_gap() {
        let mut wheel = TimingWheel::new(8, 1.0, 1.0, 16);
        wheel.reset(0);

        wheel.insert(ent(0), 3 * wheel.bucket_width_tsc());
        // Jump far past the horizon in one reap.
        wheel.reap(wheel.horizon_tsc() * 1000);
        assert_eq!(wheel.ready_len(), 1);
        assert_eq!(wheel.pending_len(), 0);
    }

    #[test]
    fn test_wheel_arena_growth() {
        let mut wheel = TimingWheel::new(8, 1.0, 1.0, 2);
        wheel.reset(0);

        for i in 0..100u16 {
            wheel.insert(ent(i), 0);
        }
        assert_eq!(wheel.pending_len(), 100);

        wheel.reap(wheel.bucket_width_tsc());
        assert_eq!(wheel.ready_len(), 100);
    }

    /// Rate realization: insert packets at a sampled target rate, reap, and
    /// check that the achieved rate lands within 5%.
    #[test]
    fn test_wheel_rate() {
        use rand::Rng;

        let freq_ghz = measure_rdtsc_freq();
        let mtu = 1024usize;
        let credits = 8usize;
        let num_pkts = 10_000usize;
        let mut rng = rand::thread_rng();

        for _ in 0..5 {
            // 0.2 - 1.0 GB/s keeps the packet gap well above the bucket width.
            let target_rate: f64 = rng.gen_range(0.2e9..1.0e9);
            let gap = pkt_gap_cycles(mtu, target_rate, freq_ghz);

            let mut wheel = TimingWheel::new(4096, 0.5, freq_ghz, 1024);
            let start = rdtsc();
            wheel.reset(start);

            let mut last_tsc = start;
            for i in 0..credits as u16 {
                wheel.insert(ent(i), last_tsc);
                last_tsc += gap;
            }

            let mut sent = 0usize;
            while sent < num_pkts {
                wheel.reap(rdtsc());
                // Pop each ready entry before inserting its successor, so a
                // large ready batch cannot double-book the window.
                while let Some(_e) = wheel.pop_ready() {
                    sent += 1;
                    let issued = sent + wheel.ready_len() + wheel.pending_len();
                    if issued < num_pkts {
                        wheel.insert(ent(0), last_tsc);
                        last_tsc += gap;
                    }
                }
            }

            let elapsed = to_sec(rdtsc() - start, freq_ghz);
            let achieved = (num_pkts * mtu) as f64 / elapsed;
            let ratio = achieved / target_rate;
            assert!(
                (0.95..=1.05).contains(&ratio),
                "target {target_rate:.3e} B/s, achieved {achieved:.3e} B/s (ratio {ratio:.3})"
            );
        }
    }
}
