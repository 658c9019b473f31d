//! Multi-level feedback queue policy.
//!
//! Five levels, level 0 highest. A process that burns through its quantum
//! moves one level down; the bottom level never demotes further and its
//! co-residents round-robin. Two events push processes back up: a pending
//! keystroke boosts the shell to level 0 at the next yield, and every
//! `MLFQ_RESET_PERIOD` of wall time all levels drop back to 0.
//!
//! Dispatchable processes are kept as slot indices in one bounded queue
//! per level, so selection is a pop from the highest non-empty level. The
//! invariant maintained by the callers: a slot sits in exactly one queue,
//! the one matching its current level, if and only if its status is Ready
//! or Runnable.

use heapless::Deque;
use log::{debug, trace};

use crate::constants::{MAX_NPROCESS, MLFQ_BASE_QUANTUM, MLFQ_LEVELS, MLFQ_RESET_PERIOD};
use crate::proc::{Pid, ProcTable, SchedInfo, Status, GPID_SHELL};

/// CPU budget at a level before demotion, in microseconds.
pub const fn quantum(level: usize) -> u64 {
    (level as u64 + 1) * MLFQ_BASE_QUANTUM
}

type ReadyQueue = Deque<usize, MAX_NPROCESS>;

const EMPTY_QUEUE: ReadyQueue = ReadyQueue::new();

/// Scheduler policy state: the reset clock and the ready queues.
pub struct Mlfq {
    last_reset: u64,
    ready: [ReadyQueue; MLFQ_LEVELS],
}

impl Mlfq {
    pub const fn new() -> Self {
        Self {
            last_reset: 0,
            ready: [EMPTY_QUEUE; MLFQ_LEVELS],
        }
    }

    /// Charge `runtime` against a process's quantum and demote it when the
    /// quantum is spent. Called whenever CPU time is accounted: on every
    /// timer tick of a running process and on every transition off a core.
    pub fn update_level(&mut self, pid: Pid, sched: &mut SchedInfo, runtime: u64) {
        sched.queue_time += runtime;
        if sched.level < MLFQ_LEVELS - 1 && sched.queue_time >= quantum(sched.level) {
            sched.level += 1;
            sched.queue_time = 0;
            trace!(target: "sched", "pid {} used its quantum, demoted to level {}", pid, sched.level);
        }
    }

    /// Boost and periodic reset; runs at every yield.
    pub fn reset_level(&mut self, now: u64, tty_pending: bool, procs: &mut ProcTable) {
        if tty_pending {
            if let Some(slot) = procs.slot_of(GPID_SHELL) {
                let pcb = procs.slot_mut(slot);
                pcb.sched.level = 0;
                pcb.sched.queue_time = 0;
                let schedulable = pcb.status.is_schedulable();
                if schedulable {
                    self.remove(slot);
                    self.enqueue_front(slot, 0);
                }
                debug!(target: "sched", "keystroke pending, shell boosted to level 0");
            }
        }

        if now - self.last_reset >= MLFQ_RESET_PERIOD {
            for i in 1..=MAX_NPROCESS {
                let pcb = procs.slot_mut(i);
                if !matches!(pcb.status, Status::Unused) {
                    pcb.sched.level = 0;
                    pcb.sched.queue_time = 0;
                }
            }
            self.collapse_ready_queues();
            self.last_reset = now;
            debug!(target: "sched", "periodic level reset at {} us", now);
        }
    }

    /// File a dispatchable slot into the queue for `level`.
    pub(crate) fn enqueue(&mut self, slot: usize, level: usize) {
        if self.ready[level].push_back(slot).is_err() {
            panic!("mlfq: ready queue overflow at level {}", level);
        }
    }

    fn enqueue_front(&mut self, slot: usize, level: usize) {
        if self.ready[level].push_front(slot).is_err() {
            panic!("mlfq: ready queue overflow at level {}", level);
        }
    }

    /// Mark a blocked process dispatchable again and file it at its
    /// current level.
    pub(crate) fn make_runnable(&mut self, procs: &mut ProcTable, slot: usize) {
        let pcb = procs.slot_mut(slot);
        pcb.status = Status::Runnable;
        let level = pcb.sched.level;
        self.enqueue(slot, level);
    }

    /// Pop the next slot to dispatch: FIFO within the highest non-empty
    /// level. None means every process is blocked or the table is empty.
    pub(crate) fn dequeue_highest(&mut self) -> Option<usize> {
        self.ready.iter_mut().find_map(|queue| queue.pop_front())
    }

    /// Drop a slot from whichever queue holds it (termination, sleep).
    pub(crate) fn remove(&mut self, slot: usize) {
        for queue in self.ready.iter_mut() {
            // Rotate once around; relative order of the rest is kept.
            for _ in 0..queue.len() {
                if let Some(s) = queue.pop_front() {
                    if s != slot {
                        let _ = queue.push_back(s);
                    }
                }
            }
        }
    }

    /// Move every queued slot into the level-0 queue, preserving order.
    fn collapse_ready_queues(&mut self) {
        let (top, rest) = self.ready.split_at_mut(1);
        for queue in rest {
            while let Some(slot) = queue.pop_front() {
                if top[0].push_back(slot).is_err() {
                    panic!("mlfq: ready queue overflow at level 0");
                }
            }
        }
    }

    #[cfg(test)]
    fn queued_at(&self, level: usize) -> Vec<usize> {
        self.ready[level].iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantum_grows_linearly_with_level() {
        assert_eq!(quantum(0), 100_000);
        assert_eq!(quantum(1), 200_000);
        assert_eq!(quantum(4), 500_000);
    }

    #[test]
    fn demotes_once_the_quantum_is_spent() {
        let mut mlfq = Mlfq::new();
        let mut sched = SchedInfo::ZERO;

        mlfq.update_level(1, &mut sched, 99_999);
        assert_eq!(sched.level, 0);

        mlfq.update_level(1, &mut sched, 1);
        assert_eq!(sched.level, 1);
        assert_eq!(sched.queue_time, 0);

        // Level 1 needs a full 200 ms.
        mlfq.update_level(1, &mut sched, 199_999);
        assert_eq!(sched.level, 1);
        mlfq.update_level(1, &mut sched, 1);
        assert_eq!(sched.level, 2);
    }

    #[test]
    fn bottom_level_never_demotes() {
        let mut mlfq = Mlfq::new();
        let mut sched = SchedInfo {
            level: MLFQ_LEVELS - 1,
            ..SchedInfo::ZERO
        };
        mlfq.update_level(1, &mut sched, 10_000_000);
        assert_eq!(sched.level, MLFQ_LEVELS - 1);
    }

    #[test]
    fn selection_prefers_higher_levels_fifo_within_one() {
        let mut mlfq = Mlfq::new();
        mlfq.enqueue(3, 2);
        mlfq.enqueue(1, 0);
        mlfq.enqueue(2, 0);
        assert_eq!(mlfq.dequeue_highest(), Some(1));
        assert_eq!(mlfq.dequeue_highest(), Some(2));
        assert_eq!(mlfq.dequeue_highest(), Some(3));
        assert_eq!(mlfq.dequeue_highest(), None);
    }

    #[test]
    fn remove_keeps_the_order_of_the_rest() {
        let mut mlfq = Mlfq::new();
        for slot in [4, 5, 6, 7] {
            mlfq.enqueue(slot, 1);
        }
        mlfq.remove(6);
        assert_eq!(mlfq.queued_at(1), vec![4, 5, 7]);
    }

    #[test]
    fn periodic_reset_collapses_levels_and_queues() {
        let mut mlfq = Mlfq::new();
        let mut procs = ProcTable::new();
        let (a, _) = procs.alloc(0);
        let (b, _) = procs.alloc(0);
        procs.slot_mut(a).status = Status::Runnable;
        procs.slot_mut(a).sched.level = 3;
        procs.slot_mut(a).sched.queue_time = 7;
        procs.slot_mut(b).status = Status::Runnable;
        procs.slot_mut(b).sched.level = 1;
        mlfq.enqueue(a, 3);
        mlfq.enqueue(b, 1);

        // Not yet due.
        mlfq.reset_level(MLFQ_RESET_PERIOD - 1, false, &mut procs);
        assert_eq!(procs.slot(a).sched.level, 3);

        mlfq.reset_level(MLFQ_RESET_PERIOD, false, &mut procs);
        assert_eq!(procs.slot(a).sched.level, 0);
        assert_eq!(procs.slot(a).sched.queue_time, 0);
        assert_eq!(procs.slot(b).sched.level, 0);
        assert_eq!(mlfq.queued_at(0), vec![b, a]);
        assert!(mlfq.queued_at(1).is_empty());
        assert!(mlfq.queued_at(3).is_empty());
    }

    #[test]
    fn pending_keystroke_boosts_the_shell_to_the_front() {
        let mut mlfq = Mlfq::new();
        let mut procs = ProcTable::new();
        // pids 1..=5; the fifth allocation is the shell.
        let mut shell_slot = 0;
        for _ in 0..5 {
            let (slot, pid) = procs.alloc(0);
            procs.slot_mut(slot).status = Status::Runnable;
            if pid == GPID_SHELL {
                shell_slot = slot;
            }
            mlfq.enqueue(slot, 0);
        }
        mlfq.remove(shell_slot);
        procs.slot_mut(shell_slot).sched.level = 4;
        mlfq.enqueue(shell_slot, 4);

        mlfq.reset_level(0, true, &mut procs);
        assert_eq!(procs.slot(shell_slot).sched.level, 0);
        assert_eq!(mlfq.queued_at(0)[0], shell_slot);
        assert!(mlfq.queued_at(4).is_empty());
    }
}
