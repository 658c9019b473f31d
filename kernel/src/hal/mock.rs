//! Scriptable [`Platform`] used by the unit tests.
//!
//! The clock only moves when a test advances it, TTY input is a flag, and
//! every hardware effect (timer rearms, MMU calls, console output, wfi) is
//! recorded so tests can assert on it. Per-process user memory is modelled
//! as one boxed syscall record per pid, which is all the kernel ever
//! translates.

use std::collections::HashMap;
use std::fmt::Write as _;

use super::{Platform, Privilege, TrapFrame};
use crate::ipc::SyscallRecord;
use crate::proc::Pid;

pub struct MockPlatform {
    pub now: u64,
    pub core: usize,
    pub cause: u32,
    pub epc: u32,
    pub frame: TrapFrame,
    pub tty_empty: bool,
    pub user_memory: HashMap<Pid, Box<SyscallRecord>>,
    pub console: String,
    pub timer_resets: Vec<usize>,
    pub mmu_switches: Vec<Pid>,
    pub mmu_frees: Vec<Pid>,
    pub flush_count: usize,
    pub wfi_count: usize,
    pub interrupts_enabled: bool,
    pub return_privilege: Option<Privilege>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            now: 0,
            core: 0,
            cause: 0,
            epc: 0,
            frame: TrapFrame::zeroed(),
            tty_empty: true,
            user_memory: HashMap::new(),
            console: String::new(),
            timer_resets: Vec::new(),
            mmu_switches: Vec::new(),
            mmu_frees: Vec::new(),
            flush_count: 0,
            wfi_count: 0,
            interrupts_enabled: false,
            return_privilege: None,
        }
    }

    /// Move the clock forward by `us` microseconds.
    pub fn advance(&mut self, us: u64) {
        self.now += us;
    }

    /// The syscall record in `pid`'s (mock) address space.
    pub fn user_record_mut(&mut self, pid: Pid) -> &mut SyscallRecord {
        self.user_memory
            .entry(pid)
            .or_insert_with(|| Box::new(SyscallRecord::zeroed()))
    }
}

impl Platform for MockPlatform {
    fn mtime_get(&self) -> u64 {
        self.now
    }

    fn timer_reset(&mut self, core: usize) {
        self.timer_resets.push(core);
    }

    fn active_core(&self) -> usize {
        self.core
    }

    fn trap_cause(&self) -> u32 {
        self.cause
    }

    fn trap_pc(&self) -> u32 {
        self.epc
    }

    fn set_trap_pc(&mut self, pc: u32) {
        self.epc = pc;
    }

    fn trap_frame(&self) -> TrapFrame {
        self.frame
    }

    fn set_trap_frame(&mut self, frame: &TrapFrame) {
        self.frame = *frame;
    }

    fn set_return_privilege(&mut self, mode: Privilege) {
        self.return_privilege = Some(mode);
    }

    fn enable_interrupts(&mut self) {
        self.interrupts_enabled = true;
    }

    fn wait_for_interrupt(&mut self) {
        self.wfi_count += 1;
    }

    fn mmu_translate(&mut self, pid: Pid, vaddr: u32) -> usize {
        assert_eq!(vaddr, crate::constants::SYSCALL_ARG);
        let record = self.user_record_mut(pid);
        record as *mut SyscallRecord as usize
    }

    fn mmu_switch(&mut self, pid: Pid) {
        self.mmu_switches.push(pid);
    }

    fn mmu_flush_cache(&mut self) {
        self.flush_count += 1;
    }

    fn mmu_free(&mut self, pid: Pid) {
        self.mmu_frees.push(pid);
    }

    fn tty_input_empty(&self) -> bool {
        self.tty_empty
    }

    fn console_write(&mut self, text: core::fmt::Arguments<'_>) {
        let _ = self.console.write_fmt(text);
    }
}
