//! Hardware abstraction consumed by the kernel core.
//!
//! The dispatcher never touches hardware directly. Everything it needs from
//! the platform is behind the [`Platform`] trait: the monotonic clock, the
//! per-core timer, the MMU, TTY input status, console output, and the trap
//! CSR state (mepc, mcause, mhartid, mstatus) together with the spilled
//! register region written by the trap stub.
//!
//! Two implementations exist: the machine-mode backing in [`metal`]
//! (RISC-V CSR access and the hooks exported by the hardware layer), and a
//! scriptable mock used by the unit tests.

use core::fmt;

use crate::constants::SAVED_REGISTER_NUM;
use crate::proc::Pid;

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
pub mod metal;

#[cfg(test)]
pub mod mock;

/// Snapshot of the 32 general-purpose registers spilled by the trap stub.
///
/// The layout is the stub's spill order. By that contract, slots 0 and 1
/// are the registers a fresh process reads argc and argv from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub regs: [u32; SAVED_REGISTER_NUM],
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            regs: [0; SAVED_REGISTER_NUM],
        }
    }
}

bitflags::bitflags! {
    /// The mstatus fields the dispatcher programs before returning from a
    /// trap: the privilege the hart drops to at mret (MPP) and the global
    /// interrupt enable (MIE).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Mstatus: u32 {
        const MIE     = 1 << 3;
        const MPP_LOW = 1 << 11;
        const MPP_HIGH = 1 << 12;
        const MPP_MASK = 0b11 << 11;
    }
}

/// Privilege mode a process runs in after mret.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privilege {
    User,
    Machine,
}

impl Privilege {
    /// MPP encoding of this mode (U = 0b00, M = 0b11).
    pub fn mpp_bits(self) -> Mstatus {
        match self {
            Privilege::User => Mstatus::empty(),
            Privilege::Machine => Mstatus::MPP_MASK,
        }
    }
}

/// The hardware facade the kernel core runs against.
///
/// The trap-entry methods (`trap_cause`, `trap_pc`, `trap_frame`) are only
/// meaningful between a trap and the matching mret, which is the only time
/// the dispatcher calls them.
pub trait Platform {
    /// Monotonic microsecond clock; never decreases, shared by all cores.
    fn mtime_get(&self) -> u64;

    /// Rearm the preemption timer for the given core.
    fn timer_reset(&mut self, core: usize);

    /// Hart id of the core currently executing the kernel (mhartid).
    fn active_core(&self) -> usize;

    /// Raw trap cause (mcause).
    fn trap_cause(&self) -> u32;

    /// Program counter at the point of the trap (mepc).
    fn trap_pc(&self) -> u32;

    /// Program counter that mret will return to.
    fn set_trap_pc(&mut self, pc: u32);

    /// Copy the spilled register file out of the trap-stub region.
    fn trap_frame(&self) -> TrapFrame;

    /// Copy a register file back into the trap-stub region for mret.
    fn set_trap_frame(&mut self, frame: &TrapFrame);

    /// Program mstatus.MPP with the mode the next process runs in.
    fn set_return_privilege(&mut self, mode: Privilege);

    /// Set mstatus.MIE so an idle core can take the next interrupt.
    fn enable_interrupts(&mut self);

    /// Park the core until an interrupt arrives (wfi).
    fn wait_for_interrupt(&mut self);

    /// Translate a virtual address in the given process's address space.
    fn mmu_translate(&mut self, pid: Pid, vaddr: u32) -> usize;

    /// Activate the address space of the given process.
    fn mmu_switch(&mut self, pid: Pid);

    /// Flush translation caches after an address-space switch.
    fn mmu_flush_cache(&mut self);

    /// Release the pages owned by a terminated process.
    fn mmu_free(&mut self, pid: Pid);

    /// Whether the TTY input buffer is empty (no pending keystroke).
    fn tty_input_empty(&self) -> bool;

    /// User-visible console output (termination reports, kill messages).
    fn console_write(&mut self, text: fmt::Arguments<'_>);
}
