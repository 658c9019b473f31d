//! Machine-mode backing for [`Platform`] on RISC-V.
//!
//! CSR access and the CLINT clock are handled here; the timer, MMU, TTY
//! and console are owned by the hardware layer and reached through the
//! `earth_*` symbols it exports. The trap stub is also the hardware
//! layer's: it takes the global kernel lock, spills the register file to
//! `SAVED_REGISTER_ADDR`, calls [`kernel_entry`], restores the region and
//! issues mret.

use core::arch::asm;
use core::cell::UnsafeCell;
use core::fmt;

use super::{Mstatus, Platform, Privilege, TrapFrame};
use crate::constants::SAVED_REGISTER_ADDR;
use crate::proc::Pid;
use crate::trap::Kernel;

extern "C" {
    fn earth_timer_reset(core: usize);
    fn earth_mmu_translate(pid: u32, vaddr: u32) -> usize;
    fn earth_mmu_switch(pid: u32);
    fn earth_mmu_flush_cache();
    fn earth_mmu_free(pid: u32);
    fn earth_tty_input_empty() -> u32;
    fn earth_tty_write(buf: *const u8, len: usize);
    /// Release and reacquire the trap lock around wfi so other cores can
    /// keep dispatching while this one idles.
    fn earth_kernel_lock_release();
    fn earth_kernel_lock_acquire();
}

// CLINT machine timer, two 32-bit halves on RV32.
const CLINT_MTIME_LO: usize = 0x0200_BFF8;
const CLINT_MTIME_HI: usize = 0x0200_BFFC;

/// CLINT tick rate; mtime ticks are converted to microseconds.
const MTIME_TICKS_PER_US: u64 = 10;

fn read_mtime() -> u64 {
    // The two halves cannot be read atomically; retry on carry.
    loop {
        let hi = unsafe { core::ptr::read_volatile(CLINT_MTIME_HI as *const u32) };
        let lo = unsafe { core::ptr::read_volatile(CLINT_MTIME_LO as *const u32) };
        let hi2 = unsafe { core::ptr::read_volatile(CLINT_MTIME_HI as *const u32) };
        if hi == hi2 {
            return ((hi as u64) << 32) | lo as u64;
        }
    }
}

fn read_mstatus() -> u32 {
    let mstatus: u32;
    unsafe {
        asm!("csrr {}, mstatus", out(reg) mstatus, options(nomem, nostack));
    }
    mstatus
}

fn write_mstatus(mstatus: u32) {
    unsafe {
        asm!("csrw mstatus, {}", in(reg) mstatus, options(nomem, nostack));
    }
}

/// Adapter that routes `core::fmt` output to the hardware console.
struct EarthConsole;

impl fmt::Write for EarthConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        unsafe { earth_tty_write(s.as_ptr(), s.len()) };
        Ok(())
    }
}

/// The [`Platform`] implementation used on real hardware.
pub struct MetalPlatform;

impl Platform for MetalPlatform {
    fn mtime_get(&self) -> u64 {
        read_mtime() / MTIME_TICKS_PER_US
    }

    fn timer_reset(&mut self, core: usize) {
        unsafe { earth_timer_reset(core) };
    }

    fn active_core(&self) -> usize {
        let id: usize;
        unsafe {
            asm!("csrr {}, mhartid", out(reg) id, options(nomem, nostack));
        }
        id
    }

    fn trap_cause(&self) -> u32 {
        let mcause: u32;
        unsafe {
            asm!("csrr {}, mcause", out(reg) mcause, options(nomem, nostack));
        }
        mcause
    }

    fn trap_pc(&self) -> u32 {
        let mepc: u32;
        unsafe {
            asm!("csrr {}, mepc", out(reg) mepc, options(nomem, nostack));
        }
        mepc
    }

    fn set_trap_pc(&mut self, pc: u32) {
        unsafe {
            asm!("csrw mepc, {}", in(reg) pc, options(nomem, nostack));
        }
    }

    fn trap_frame(&self) -> TrapFrame {
        // Safety: the stub has spilled the full register file to this
        // region before entering the kernel, and holds the lock for us.
        unsafe { core::ptr::read_volatile(SAVED_REGISTER_ADDR as usize as *const TrapFrame) }
    }

    fn set_trap_frame(&mut self, frame: &TrapFrame) {
        // Safety: same region and lock discipline as `trap_frame`.
        unsafe {
            core::ptr::write_volatile(SAVED_REGISTER_ADDR as usize as *mut TrapFrame, *frame)
        };
    }

    fn set_return_privilege(&mut self, mode: Privilege) {
        let mut mstatus = Mstatus::from_bits_retain(read_mstatus());
        mstatus.remove(Mstatus::MPP_MASK);
        mstatus.insert(mode.mpp_bits());
        write_mstatus(mstatus.bits());
    }

    fn enable_interrupts(&mut self) {
        write_mstatus((Mstatus::from_bits_retain(read_mstatus()) | Mstatus::MIE).bits());
    }

    fn wait_for_interrupt(&mut self) {
        // Holding the trap lock through wfi would stall every other core.
        unsafe {
            earth_kernel_lock_release();
            asm!("wfi", options(nomem, nostack));
            earth_kernel_lock_acquire();
        }
    }

    fn mmu_translate(&mut self, pid: Pid, vaddr: u32) -> usize {
        unsafe { earth_mmu_translate(pid, vaddr) }
    }

    fn mmu_switch(&mut self, pid: Pid) {
        unsafe { earth_mmu_switch(pid) };
    }

    fn mmu_flush_cache(&mut self) {
        unsafe { earth_mmu_flush_cache() };
    }

    fn mmu_free(&mut self, pid: Pid) {
        unsafe { earth_mmu_free(pid) };
    }

    fn tty_input_empty(&self) -> bool {
        unsafe { earth_tty_input_empty() != 0 }
    }

    fn console_write(&mut self, text: fmt::Arguments<'_>) {
        let _ = fmt::Write::write_fmt(&mut EarthConsole, text);
    }
}

/// The single kernel instance. Access is serialised by the trap lock the
/// stub holds whenever `kernel_entry` runs, so no further locking is done
/// here.
struct KernelCell(UnsafeCell<Kernel<MetalPlatform>>);

// Safety: only one core at a time reaches the inner value (trap lock).
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(Kernel::new(MetalPlatform)));

/// Trap-stub entry point. Called with the kernel lock held and the
/// register file already spilled.
#[no_mangle]
pub extern "C" fn kernel_entry() {
    // Safety: the stub's lock guarantees exclusive access.
    let kernel = unsafe { &mut *KERNEL.0.get() };
    kernel.kernel_entry();
}
