//! Process table and lifecycle state.
//!
//! Every process is a fixed-size control block in an arena of
//! `MAX_NPROCESS + 1` slots. Slot 0 is the idle sentinel: a core whose
//! `core_to_proc_idx` entry is 0 is not running anything, and the sentinel
//! also provides a harmless context image for the trap-exit path while a
//! core idles. Real processes live in slots 1 and up.
//!
//! A blocked process carries its blocking reason as data: how long it
//! sleeps, whom it is sending to (with the message), or whom it is willing
//! to receive from (with the delivered envelope once a sender matched).
//! Scheduler wake-up and IPC retry are pattern matches over that reason,
//! so a sleeping process can never also look like a pending syscall and
//! vice versa.

use core::fmt;

use crate::constants::{MAX_NPROCESS, NCORES, RESPONSE_TIME_CAP, SYSCALL_MSG_LEN};
use crate::hal::TrapFrame;

/// Process identifier. Assigned monotonically, never reused within a run.
pub type Pid = u32;

/// Wildcard pid: matches any sender in a receive, never an actual process.
pub const GPID_ALL: Pid = 0;
/// The process-manager server.
pub const GPID_PROCESS: Pid = 1;
/// The terminal server.
pub const GPID_TERMINAL: Pid = 2;
/// The file server.
pub const GPID_FILE: Pid = 3;
/// The directory server.
pub const GPID_DIR: Pid = 4;
/// The shell; target of the interactive boost.
pub const GPID_SHELL: Pid = 5;
/// Smallest pid that runs in user mode.
pub const GPID_USER_START: Pid = 6;

/// Inline IPC message body.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Payload(pub [u8; SYSCALL_MSG_LEN]);

impl Payload {
    pub const fn zeroed() -> Self {
        Self([0; SYSCALL_MSG_LEN])
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", SYSCALL_MSG_LEN)
    }
}

/// Which senders a receive accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderFilter {
    /// `GPID_ALL` on the wire: take the first matching sender.
    Any,
    /// Take messages from this pid only.
    From(Pid),
}

impl SenderFilter {
    pub fn from_wire(raw: Pid) -> Self {
        if raw == GPID_ALL {
            SenderFilter::Any
        } else {
            SenderFilter::From(raw)
        }
    }

    pub fn admits(self, pid: Pid) -> bool {
        match self {
            SenderFilter::Any => true,
            SenderFilter::From(only) => only == pid,
        }
    }
}

/// A delivered message: who sent it and its body.
#[derive(Clone, Copy, Debug)]
pub struct Envelope {
    pub sender: Pid,
    pub msg: Payload,
}

/// Why a process is not runnable.
#[derive(Clone, Debug)]
pub enum BlockReason {
    /// Asleep until the clock reaches this microsecond timestamp.
    SleepUntil(u64),
    /// A send waiting for `peer` to post a matching receive.
    SendingTo { peer: Pid, msg: Payload },
    /// A receive; `inbox` is filled by the first admitted sender and
    /// copied back to user space at the next yield.
    Receiving {
        from: SenderFilter,
        inbox: Option<Envelope>,
    },
}

/// Lifecycle status of a table slot.
#[derive(Clone, Debug)]
pub enum Status {
    /// Free slot.
    Unused,
    /// Allocated, image still being loaded.
    Loading,
    /// Loaded but never dispatched.
    Ready,
    /// Dispatchable, has run before.
    Runnable,
    /// Currently on a core.
    Running,
    /// Waiting on a syscall or a sleep.
    Blocked(BlockReason),
}

impl Status {
    /// Can the scheduler pick this process?
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Status::Ready | Status::Runnable)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Status::Blocked(_))
    }
}

/// Scheduling state of one process.
#[derive(Clone, Copy, Debug)]
pub struct SchedInfo {
    /// Feedback-queue level, 0 is highest priority.
    pub level: usize,
    /// Microseconds of CPU consumed at the current level.
    pub queue_time: u64,
    /// When this process last went on (or was charged on) a core.
    pub last_schedule: u64,
}

impl SchedInfo {
    pub const ZERO: Self = Self {
        level: 0,
        queue_time: 0,
        last_schedule: 0,
    };
}

/// Lifecycle accounting of one process, all timestamps in microseconds.
#[derive(Clone, Copy, Debug)]
pub struct LifeStats {
    pub creation_time: u64,
    /// 0 until the first dispatch.
    pub first_schedule_time: u64,
    pub total_cpu_time: u64,
    pub termination_time: u64,
    pub timer_interrupt_count: u32,
}

impl LifeStats {
    pub const ZERO: Self = Self {
        creation_time: 0,
        first_schedule_time: 0,
        total_cpu_time: 0,
        termination_time: 0,
        timer_interrupt_count: 0,
    };

    /// Derive the numbers printed when a process terminates.
    ///
    /// A response time exceeding the turnaround or the 10 s cap means the
    /// clock was not warm when the process was created; such values are
    /// replaced by half the turnaround.
    pub fn termination_report(&self) -> TerminationReport {
        let turnaround = self.termination_time.saturating_sub(self.creation_time);
        let mut response = self
            .first_schedule_time
            .saturating_sub(self.creation_time);
        if response > turnaround || response > RESPONSE_TIME_CAP {
            response = turnaround / 2;
        }
        let waiting = turnaround.saturating_sub(response + self.total_cpu_time);

        TerminationReport {
            turnaround_ms: turnaround / 1000,
            response_ms: response / 1000,
            cpu_ms: self.total_cpu_time / 1000,
            waiting_ms: waiting / 1000,
            timer_interrupts: self.timer_interrupt_count,
        }
    }
}

/// Milliseconds reported on the console at process termination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminationReport {
    pub turnaround_ms: u64,
    pub response_ms: u64,
    pub cpu_ms: u64,
    pub waiting_ms: u64,
    pub timer_interrupts: u32,
}

/// Process control block.
#[derive(Clone, Debug)]
pub struct Pcb {
    pub pid: Pid,
    pub status: Status,
    /// Saved program counter at the point of the trap.
    pub mepc: u32,
    /// Saved register file at the point of the trap.
    pub saved_registers: TrapFrame,
    pub sched: SchedInfo,
    pub stats: LifeStats,
}

const UNUSED_PCB: Pcb = Pcb {
    pid: 0,
    status: Status::Unused,
    mepc: 0,
    saved_registers: TrapFrame::zeroed(),
    sched: SchedInfo::ZERO,
    stats: LifeStats::ZERO,
};

/// Fixed arena of control blocks plus the per-core dispatch map.
pub struct ProcTable {
    slots: [Pcb; MAX_NPROCESS + 1],
    /// Slot index each core is running; 0 means the core is idle.
    on_core: [usize; NCORES],
    next_pid: Pid,
}

impl ProcTable {
    pub const fn new() -> Self {
        Self {
            slots: [UNUSED_PCB; MAX_NPROCESS + 1],
            on_core: [0; NCORES],
            next_pid: 0,
        }
    }

    pub fn slot(&self, slot: usize) -> &Pcb {
        &self.slots[slot]
    }

    pub(crate) fn slot_mut(&mut self, slot: usize) -> &mut Pcb {
        &mut self.slots[slot]
    }

    /// Slot index of a live process, by pid. Freed slots keep their stale
    /// pid but are Unused and never match.
    pub fn slot_of(&self, pid: Pid) -> Option<usize> {
        (1..=MAX_NPROCESS)
            .find(|&i| self.slots[i].pid == pid && !matches!(self.slots[i].status, Status::Unused))
    }

    /// Mutable access to two distinct slots at once.
    pub(crate) fn pair_mut(&mut self, a: usize, b: usize) -> (&mut Pcb, &mut Pcb) {
        assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.slots.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.slots.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    /// Claim the first free slot for a fresh process.
    ///
    /// Panics when the table is full; running out of process slots is an
    /// unrecoverable configuration error in this system.
    pub(crate) fn alloc(&mut self, now: u64) -> (usize, Pid) {
        for i in 1..=MAX_NPROCESS {
            if matches!(self.slots[i].status, Status::Unused) {
                self.next_pid += 1;
                let pid = self.next_pid;
                self.slots[i] = Pcb {
                    pid,
                    status: Status::Loading,
                    mepc: 0,
                    saved_registers: TrapFrame::zeroed(),
                    sched: SchedInfo::ZERO,
                    stats: LifeStats {
                        creation_time: now,
                        ..LifeStats::ZERO
                    },
                };
                return (i, pid);
            }
        }
        panic!("proc_alloc: reached the limit of {} processes", MAX_NPROCESS);
    }

    /// Slot currently dispatched on a core; 0 while the core is idle.
    pub fn on_core(&self, core: usize) -> usize {
        self.on_core[core]
    }

    pub(crate) fn set_on_core(&mut self, core: usize, slot: usize) {
        self.on_core[core] = slot;
    }

    /// Drop any core mapping that still points at a freed slot.
    pub(crate) fn clear_core_refs(&mut self, slot: usize) {
        for entry in self.on_core.iter_mut() {
            if *entry == slot {
                *entry = 0;
            }
        }
    }

    /// Charge CPU time for a process leaving a core.
    ///
    /// Returns the charged interval when the slot was Running with a valid
    /// schedule stamp, so the caller can feed the scheduler's quantum
    /// accounting.
    pub(crate) fn charge_if_running(&mut self, slot: usize, now: u64) -> Option<u64> {
        let pcb = &mut self.slots[slot];
        if matches!(pcb.status, Status::Running) && pcb.sched.last_schedule > 0 {
            let runtime = now.saturating_sub(pcb.sched.last_schedule);
            pcb.stats.total_cpu_time += runtime;
            Some(runtime)
        } else {
            None
        }
    }
}
