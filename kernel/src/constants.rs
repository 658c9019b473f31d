//! Kernel-wide tunables and the platform memory-map contract.
//!
//! Everything here is shared between the kernel core and the platform
//! layer: table capacities, scheduler tunables, and the well-known virtual
//! addresses that user processes and the trap stub agree on.

/// Number of hardware execution contexts (harts) the kernel schedules on.
pub const NCORES: usize = 4;

/// Capacity of the process table, excluding the idle sentinel slot.
pub const MAX_NPROCESS: usize = 16;

/// General-purpose registers spilled by the trap stub.
pub const SAVED_REGISTER_NUM: usize = 32;

/// Byte size of the spilled register region.
pub const SAVED_REGISTER_SIZE: u32 = (SAVED_REGISTER_NUM * 4) as u32;

/// Inline payload length of one IPC message, in bytes.
pub const SYSCALL_MSG_LEN: usize = 1024;

// Scheduler tunables

/// Number of feedback-queue levels; level 0 is the highest priority.
pub const MLFQ_LEVELS: usize = 5;

/// Quantum at level 0 in microseconds; level L gets `(L + 1)` times this.
pub const MLFQ_BASE_QUANTUM: u64 = 100_000;

/// All queue levels drop back to 0 this often (microseconds of wall time).
pub const MLFQ_RESET_PERIOD: u64 = 10_000_000;

/// Response times above this are treated as a not-yet-warm clock and
/// clamped when the termination report is computed (microseconds).
pub const RESPONSE_TIME_CAP: u64 = 10_000_000;

// Memory-map contract
//
// Virtual addresses shared with the trap stub and the process loader. The
// trap stub spills the interrupted register file just below the top of the
// kernel stack; every process image keeps its syscall record at SYSCALL_ARG
// and is first entered at APPS_ENTRY with the argument block at APPS_ARG.

/// Top of the kernel stack region.
pub const KERNEL_STACK_TOP: u32 = 0x8020_0000;

/// Start of the spilled trap frame (32 GPRs in canonical order).
pub const SAVED_REGISTER_ADDR: u32 = KERNEL_STACK_TOP - SAVED_REGISTER_SIZE;

/// Entry point of a newly loaded process image.
pub const APPS_ENTRY: u32 = 0x8040_0000;

/// argc/argv block primed into a process's first two saved registers.
pub const APPS_ARG: u32 = 0x803F_E000;

/// Address of the syscall record in every process address space.
pub const SYSCALL_ARG: u32 = 0x803F_F000;
