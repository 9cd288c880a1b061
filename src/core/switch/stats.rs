//! Performance and trace counters
//!
//! Cycle histograms for the context-switch path and the bounded
//! switch-history ring kept by the controller.

use crate::config::CFG_SWITCH_HISTORY_DEPTH;
use crate::core::cs_cell::CsCell;
use crate::critical::critical_section;
use crate::types::{SchedulerId, SwitchReason, TimeUs};

// ============ Cycle statistics ============

const BUCKET_COUNT: usize = 16;

/// Min/max/average plus a power-of-two histogram over cycle samples.
///
/// Bucket `i` covers samples in `[2^i, 2^(i+1))`; everything at or above
/// `2^15` lands in the last bucket. Percentile queries return the upper
/// bound of the bucket holding the requested rank.
#[derive(Debug, Clone, Copy)]
pub struct CycleStats {
    count: u32,
    min: u32,
    max: u32,
    sum: u64,
    over_budget: u32,
    buckets: [u32; BUCKET_COUNT],
}

impl CycleStats {
    pub const fn new() -> Self {
        CycleStats {
            count: 0,
            min: u32::MAX,
            max: 0,
            sum: 0,
            over_budget: 0,
            buckets: [0; BUCKET_COUNT],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Fold one sample in; `budget` drives the warning counter.
    pub fn record(&mut self, cycles: u32, budget: u32) {
        self.count = self.count.wrapping_add(1);
        self.sum += cycles as u64;
        if cycles < self.min {
            self.min = cycles;
        }
        if cycles > self.max {
            self.max = cycles;
        }
        if cycles > budget {
            self.over_budget = self.over_budget.wrapping_add(1);
        }

        self.buckets[Self::bucket_index(cycles)] += 1;
    }

    #[inline]
    fn bucket_index(cycles: u32) -> usize {
        if cycles == 0 {
            return 0;
        }
        let log2 = 31 - cycles.leading_zeros() as usize;
        log2.min(BUCKET_COUNT - 1)
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    #[inline]
    pub fn min(&self) -> u32 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    #[inline]
    pub fn max(&self) -> u32 {
        self.max
    }

    #[inline]
    pub fn avg(&self) -> u32 {
        if self.count == 0 {
            0
        } else {
            (self.sum / self.count as u64) as u32
        }
    }

    /// Samples that exceeded the configured budget
    #[inline]
    pub fn over_budget(&self) -> u32 {
        self.over_budget
    }

    /// Approximate percentile, `p` in 1..=100
    pub fn percentile(&self, p: u8) -> u32 {
        if self.count == 0 {
            return 0;
        }
        let rank = (self.count as u64 * p as u64).div_ceil(100);

        let mut cum: u64 = 0;
        for (idx, &n) in self.buckets.iter().enumerate() {
            cum += n as u64;
            if cum >= rank {
                if idx == BUCKET_COUNT - 1 {
                    return self.max;
                }
                return (1u32 << (idx + 1)) - 1;
            }
        }
        self.max
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Cycle samples taken by the context-switch path.
///
/// Mutated from PendSV with interrupts masked; everyone else goes through
/// [`switch_cycle_stats`].
pub(crate) static SWITCH_CYCLES: CsCell<CycleStats> = CsCell::new(CycleStats::new());

/// Copy of the context-switch cycle statistics
pub fn switch_cycle_stats() -> CycleStats {
    critical_section(|cs| *SWITCH_CYCLES.get(cs))
}

/// Zero the context-switch cycle statistics
pub fn reset_switch_cycle_stats() {
    critical_section(|cs| SWITCH_CYCLES.get(cs).reset());
}

// ============ Switch history ============

/// One completed (or failed) scheduler-switch attempt
#[derive(Debug, Clone, Copy)]
pub struct SwitchHistoryRecord {
    pub timestamp_us: TimeUs,
    pub from: SchedulerId,
    pub to: SchedulerId,
    pub reason: SwitchReason,
    pub duration_us: TimeUs,
    pub tasks_migrated: u16,
    pub success: bool,
    pub error_code: u16,
}

/// Bounded ring of switch outcomes, oldest overwritten first
#[derive(Debug, Clone, Copy)]
pub struct SwitchHistory {
    ring: [Option<SwitchHistoryRecord>; CFG_SWITCH_HISTORY_DEPTH],
    next: usize,
    len: usize,
}

impl SwitchHistory {
    pub const fn new() -> Self {
        SwitchHistory {
            ring: [None; CFG_SWITCH_HISTORY_DEPTH],
            next: 0,
            len: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn push(&mut self, record: SwitchHistoryRecord) {
        self.ring[self.next] = Some(record);
        self.next = (self.next + 1) % CFG_SWITCH_HISTORY_DEPTH;
        if self.len < CFG_SWITCH_HISTORY_DEPTH {
            self.len += 1;
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Entry `i` back from the most recent, 0 = newest
    pub fn get(&self, i: usize) -> Option<&SwitchHistoryRecord> {
        if i >= self.len {
            return None;
        }
        let idx = (self.next + CFG_SWITCH_HISTORY_DEPTH - 1 - i) % CFG_SWITCH_HISTORY_DEPTH;
        self.ring[idx].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SwitchHistoryRecord> {
        (0..self.len).filter_map(move |i| self.get(i))
    }

    pub fn success_count(&self) -> usize {
        self.iter().filter(|r| r.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.iter().filter(|r| !r.success).count()
    }
}

impl Default for SwitchHistory {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Controller totals ============

/// Aggregate counters kept by the switch controller
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchStats {
    pub total_switches: u32,
    pub successful_switches: u32,
    pub failed_switches: u32,
    pub rollback_count: u32,
    pub tasks_migrated: u32,
    pub max_duration_us: TimeUs,
    pub max_critical_us: TimeUs,
}

impl SwitchStats {
    pub const fn new() -> Self {
        SwitchStats {
            total_switches: 0,
            successful_switches: 0,
            failed_switches: 0,
            rollback_count: 0,
            tasks_migrated: 0,
            max_duration_us: 0,
            max_critical_us: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_stats_basics() {
        let mut stats = CycleStats::new();
        assert_eq!(stats.min(), 0);
        assert_eq!(stats.avg(), 0);

        stats.record(100, 250);
        stats.record(140, 250);
        stats.record(300, 250);

        assert_eq!(stats.count(), 3);
        assert_eq!(stats.min(), 100);
        assert_eq!(stats.max(), 300);
        assert_eq!(stats.avg(), 180);
        assert_eq!(stats.over_budget(), 1);
    }

    #[test]
    fn cycle_stats_percentile() {
        let mut stats = CycleStats::new();
        for _ in 0..90 {
            stats.record(100, 250); // bucket 6, upper bound 127
        }
        for _ in 0..10 {
            stats.record(1000, 250); // bucket 9, upper bound 1023
        }

        assert_eq!(stats.percentile(50), 127);
        assert_eq!(stats.percentile(90), 127);
        assert_eq!(stats.percentile(99), 1023);
    }

    #[test]
    fn history_ring_wraps() {
        let mut history = SwitchHistory::new();
        for i in 0..20u16 {
            history.push(SwitchHistoryRecord {
                timestamp_us: i as TimeUs,
                from: 0,
                to: 1,
                reason: SwitchReason::Test,
                duration_us: 0,
                tasks_migrated: i,
                success: i % 2 == 0,
                error_code: 0,
            });
        }

        assert_eq!(history.len(), CFG_SWITCH_HISTORY_DEPTH);
        // newest entry is the last pushed
        assert_eq!(history.get(0).map(|r| r.tasks_migrated), Some(19));
        // oldest surviving entry is 20 - 16 = 4
        assert_eq!(history.get(15).map(|r| r.tasks_migrated), Some(4));
        assert_eq!(history.success_count() + history.failure_count(), 16);
    }
}
