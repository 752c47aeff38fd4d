//! Per-exam anomaly bookkeeping: seat counters and the snapshot-trigger
//! state machine.

use std::collections::{BTreeMap, HashMap};

use invigil_types::{ClassId, SeatId};

/// Consecutive-frame run state for one `(seat, class)` pair.
#[derive(Debug, Default, Clone)]
struct AnomalyRun {
    consecutive: u64,
    last_frame: u64,
    last_snapshot_frame: Option<u64>,
}

/// Counters and snapshot runs for the current exam. Owned by the exam
/// record; mutated by the post-processor under the exam lock.
#[derive(Debug, Default)]
pub struct AnomalyLedger {
    counts: BTreeMap<SeatId, u64>,
    runs: HashMap<(SeatId, ClassId), AnomalyRun>,
}

impl AnomalyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the anomaly counter for a seat.
    pub fn count_anomaly(&mut self, seat: SeatId) {
        *self.counts.entry(seat).or_insert(0) += 1;
    }

    pub fn count_for(&self, seat: SeatId) -> u64 {
        self.counts.get(&seat).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &BTreeMap<SeatId, u64> {
        &self.counts
    }

    /// Record a snapshot-class occurrence at global frame `frame`.
    ///
    /// A run grows only over strictly consecutive frames; any gap resets it
    /// to 1. Returns true when a snapshot should be taken: the run reached
    /// `threshold` frames and at least `cooldown` frames passed since the
    /// last snapshot for this pair. Firing resets the run.
    pub fn record_run(
        &mut self,
        seat: SeatId,
        class: ClassId,
        frame: u64,
        threshold: u64,
        cooldown: u64,
    ) -> bool {
        let run = self.runs.entry((seat, class)).or_default();
        if run.last_frame + 1 == frame {
            run.consecutive += 1;
        } else {
            run.consecutive = 1;
        }
        run.last_frame = frame;

        let cooled = match run.last_snapshot_frame {
            None => true,
            Some(last) => frame - last >= cooldown,
        };
        if run.consecutive >= threshold && cooled {
            run.last_snapshot_frame = Some(frame);
            run.consecutive = 0;
            true
        } else {
            false
        }
    }

    /// Forget everything: counters and runs.
    pub fn reset(&mut self) {
        self.counts.clear();
        self.runs.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty() && self.runs.is_empty()
    }
}
