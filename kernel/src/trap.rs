//! Trap dispatcher: the kernel is two handlers.
//!
//! The exception path services environment calls and kills faulting user
//! processes; the interrupt path services the preemption timer. Both end
//! in the same yield point, which wakes sleepers, retries blocked
//! syscalls, asks the MLFQ policy for the next process and programs the
//! hart for it, or parks the hart when nothing is runnable.
//!
//! ## Entry contract
//!
//! By the time [`Kernel::kernel_entry`] runs, the platform trap stub has
//! spilled the interrupted register file to `SAVED_REGISTER_ADDR`, entered
//! machine mode and taken the global kernel lock, so exactly one core is
//! inside the dispatcher at a time. On return the stub restores the
//! region and issues mret. The whole handler runs to completion; nothing
//! in here suspends.

use core::ptr;

use log::{debug, trace};

use crate::constants::{APPS_ARG, APPS_ENTRY, MAX_NPROCESS, NCORES, SYSCALL_ARG};
use crate::hal::{Platform, Privilege};
use crate::ipc::{self, SyscallRecord};
use crate::mlfq::Mlfq;
use crate::proc::{
    BlockReason, Payload, Pcb, Pid, ProcTable, SenderFilter, Status, GPID_ALL, GPID_USER_START,
};

/// mcause values the dispatcher understands.
pub mod cause {
    /// High bit of mcause: set for interrupts, clear for exceptions.
    pub const INTERRUPT_FLAG: u32 = 1 << 31;
    /// Low bits of mcause carrying the interrupt id.
    pub const INTERRUPT_ID_MASK: u32 = 0x3FF;

    /// Machine timer interrupt.
    pub const INTR_TIMER: u32 = 7;

    /// Illegal instruction exception.
    pub const EXCP_ILLEGAL_INSTRUCTION: u32 = 2;
    /// Environment call from U-mode.
    pub const EXCP_ECALL_USER: u32 = 8;
    /// Environment call from M-mode.
    pub const EXCP_ECALL_MACHINE: u32 = 11;
}

/// The kernel context: process table, scheduler policy and the platform
/// handle, with the dispatcher and lifecycle entry points as methods.
///
/// There is exactly one of these per machine; the platform glue owns it
/// behind the trap lock (see `hal::metal`).
pub struct Kernel<P: Platform> {
    hal: P,
    procs: ProcTable,
    sched: Mlfq,
    /// Hart id of the core currently executing the dispatcher.
    core_in_kernel: usize,
}

impl<P: Platform> Kernel<P> {
    pub const fn new(hal: P) -> Self {
        Self {
            hal,
            procs: ProcTable::new(),
            sched: Mlfq::new(),
            core_in_kernel: 0,
        }
    }

    pub fn platform(&self) -> &P {
        &self.hal
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.hal
    }

    pub fn process_table(&self) -> &ProcTable {
        &self.procs
    }

    /// Control block of a live process, by pid.
    pub fn process(&self, pid: Pid) -> Option<&Pcb> {
        self.procs.slot_of(pid).map(|slot| self.procs.slot(slot))
    }

    // Lifecycle entry points, used by the loader and the process-manager
    // server.

    /// Claim a table slot for a new process and stamp its creation time.
    pub fn proc_alloc(&mut self) -> Pid {
        let now = self.hal.mtime_get();
        let (slot, pid) = self.procs.alloc(now);
        debug!(target: "proc", "allocated pid {} in slot {}", pid, slot);
        pid
    }

    /// Mark a loaded process dispatchable for the first time.
    pub fn proc_set_ready(&mut self, pid: Pid) {
        if let Some(slot) = self.procs.slot_of(pid) {
            let pcb = self.procs.slot_mut(slot);
            pcb.status = Status::Ready;
            let level = pcb.sched.level;
            self.sched.enqueue(slot, level);
        }
    }

    /// Terminate one process, or every user process for `GPID_ALL`.
    ///
    /// Prints the lifecycle report, releases the MMU pages and recycles
    /// the slot.
    pub fn proc_free(&mut self, pid: Pid) {
        if pid != GPID_ALL {
            if let Some(slot) = self.procs.slot_of(pid) {
                self.free_slot(slot);
            }
            return;
        }
        for slot in 1..=MAX_NPROCESS {
            let pcb = self.procs.slot(slot);
            if pcb.pid >= GPID_USER_START && !matches!(pcb.status, Status::Unused) {
                self.free_slot(slot);
            }
        }
    }

    fn free_slot(&mut self, slot: usize) {
        let now = self.hal.mtime_get();
        let (pid, report, level) = {
            let pcb = self.procs.slot_mut(slot);
            pcb.stats.termination_time = now;
            (pcb.pid, pcb.stats.termination_report(), pcb.sched.level)
        };

        self.hal
            .console_write(format_args!("Process {} terminated:\n", pid));
        self.hal
            .console_write(format_args!("  Turnaround time: {} ms\n", report.turnaround_ms));
        self.hal
            .console_write(format_args!("  Response time: {} ms\n", report.response_ms));
        self.hal
            .console_write(format_args!("  Total CPU time: {} ms\n", report.cpu_ms));
        self.hal
            .console_write(format_args!("  Waiting time: {} ms\n", report.waiting_ms));
        self.hal
            .console_write(format_args!("  Timer interrupts: {}\n", report.timer_interrupts));
        self.hal
            .console_write(format_args!("  Final queue level: {}\n", level));

        self.hal.mmu_free(pid);
        self.sched.remove(slot);
        self.procs.clear_core_refs(slot);
        self.procs.slot_mut(slot).status = Status::Unused;
        debug!(target: "proc", "freed pid {}", pid);
    }

    /// Put a process to sleep for `usec` microseconds of wall time.
    pub fn sleep(&mut self, pid: Pid, usec: u64) {
        let now = self.hal.mtime_get();
        if let Some(slot) = self.procs.slot_of(pid) {
            if let Some(runtime) = self.procs.charge_if_running(slot, now) {
                self.sched
                    .update_level(pid, &mut self.procs.slot_mut(slot).sched, runtime);
            }
            if self.procs.slot(slot).status.is_schedulable() {
                self.sched.remove(slot);
            }
            let wakeup = now + usec;
            self.procs.slot_mut(slot).status = Status::Blocked(BlockReason::SleepUntil(wakeup));
            trace!(target: "proc", "pid {} sleeping until {} us", pid, wakeup);
        }
    }

    /// Print which process each core is running.
    pub fn cores_info(&mut self) {
        self.hal.console_write(format_args!("Core information:\n"));
        for core in 0..NCORES {
            let slot = self.procs.on_core(core);
            let running = if slot != 0 && matches!(self.procs.slot(slot).status, Status::Running) {
                Some(self.procs.slot(slot).pid)
            } else {
                None
            };
            match running {
                Some(pid) => self
                    .hal
                    .console_write(format_args!("  Core {}: Process {}\n", core, pid)),
                None => self.hal.console_write(format_args!("  Core {}: Idle\n", core)),
            }
        }
    }

    // The dispatcher.

    /// Machine-trap entry point. See the module docs for the stub
    /// contract.
    pub fn kernel_entry(&mut self) {
        self.core_in_kernel = self.hal.active_core();
        let slot = self.procs.on_core(self.core_in_kernel);

        // Save the interrupted context into the current control block
        // (slot 0 absorbs it harmlessly while the core is idle).
        let frame = self.hal.trap_frame();
        let pc = self.hal.trap_pc();
        {
            let pcb = self.procs.slot_mut(slot);
            pcb.saved_registers = frame;
            pcb.mepc = pc;
        }

        let mcause = self.hal.trap_cause();
        if mcause & cause::INTERRUPT_FLAG != 0 {
            self.intr_entry(mcause & cause::INTERRUPT_ID_MASK);
        } else {
            self.excp_entry(mcause);
        }

        // Restore whichever process is now current on this core.
        let slot = self.procs.on_core(self.core_in_kernel);
        let pc = self.procs.slot(slot).mepc;
        let frame = self.procs.slot(slot).saved_registers;
        self.hal.set_trap_pc(pc);
        self.hal.set_trap_frame(&frame);
    }

    fn excp_entry(&mut self, id: u32) {
        let slot = self.procs.on_core(self.core_in_kernel);
        let pid = self.procs.slot(slot).pid;

        if (cause::EXCP_ECALL_USER..=cause::EXCP_ECALL_MACHINE).contains(&id) {
            self.ingest_syscall(slot, pid);
            self.reschedule();
            return;
        }

        if pid >= GPID_USER_START {
            self.hal.console_write(format_args!(
                "Process {} killed due to exception {}\n",
                pid, id
            ));
            self.proc_free(pid);
            self.reschedule();
            return;
        }

        panic!("excp_entry: kernel got exception {}", id);
    }

    /// Pull the caller's syscall record out of its address space and turn
    /// it into a blocking reason, then give the syscall one immediate try.
    fn ingest_syscall(&mut self, slot: usize, pid: Pid) {
        let paddr = self.hal.mmu_translate(pid, SYSCALL_ARG);
        // Safety: the platform guarantees SYSCALL_ARG maps a readable,
        // 4-byte-aligned syscall record in every process image.
        let record: SyscallRecord = unsafe { ptr::read(paddr as *const SyscallRecord) };

        let reason = match record.kind {
            ipc::SYS_SEND => BlockReason::SendingTo {
                peer: record.receiver,
                msg: Payload(record.content),
            },
            ipc::SYS_RECV => BlockReason::Receiving {
                from: SenderFilter::from_wire(record.sender),
                inbox: None,
            },
            other => panic!("ingest_syscall: unknown syscall type={}", other),
        };

        // The caller leaves the core: account its time, block it, and
        // resume past the 4-byte ecall instruction when it returns.
        let now = self.hal.mtime_get();
        if let Some(runtime) = self.procs.charge_if_running(slot, now) {
            self.sched
                .update_level(pid, &mut self.procs.slot_mut(slot).sched, runtime);
        }
        let pcb = self.procs.slot_mut(slot);
        pcb.status = Status::Blocked(reason);
        pcb.mepc += 4;

        ipc::try_syscall(&mut self.hal, &mut self.procs, &mut self.sched, slot);
    }

    fn intr_entry(&mut self, id: u32) {
        if id != cause::INTR_TIMER {
            panic!("intr_entry: kernel got interrupt {}", id);
        }

        let slot = self.procs.on_core(self.core_in_kernel);
        if slot != 0 {
            let now = self.hal.mtime_get();
            let (pid, charged) = {
                let pcb = self.procs.slot_mut(slot);
                pcb.stats.timer_interrupt_count += 1;
                let charged = if pcb.sched.last_schedule > 0 {
                    let runtime = now.saturating_sub(pcb.sched.last_schedule);
                    pcb.stats.total_cpu_time += runtime;
                    Some(runtime)
                } else {
                    None
                };
                (pcb.pid, charged)
            };
            if let Some(runtime) = charged {
                self.sched
                    .update_level(pid, &mut self.procs.slot_mut(slot).sched, runtime);
            }
            self.procs.slot_mut(slot).sched.last_schedule = now;
        }

        self.reschedule();
    }

    /// The yield point: every trap ends here.
    fn reschedule(&mut self) {
        let core = self.core_in_kernel;
        let slot = self.procs.on_core(core);
        let now = self.hal.mtime_get();

        // A process that is still running was preempted; it goes back to
        // its queue.
        if slot != 0 && matches!(self.procs.slot(slot).status, Status::Running) {
            if let Some(runtime) = self.procs.charge_if_running(slot, now) {
                let pid = self.procs.slot(slot).pid;
                self.sched
                    .update_level(pid, &mut self.procs.slot_mut(slot).sched, runtime);
            }
            self.sched.make_runnable(&mut self.procs, slot);
        }

        let tty_pending = !self.hal.tty_input_empty();
        self.sched.reset_level(now, tty_pending, &mut self.procs);

        // Wake elapsed sleepers; retry every blocked syscall (matching is
        // level triggered, a receiver may have shown up since last time).
        for s in 1..=MAX_NPROCESS {
            match &self.procs.slot(s).status {
                Status::Blocked(BlockReason::SleepUntil(wakeup)) if now >= *wakeup => {
                    trace!(target: "sched", "pid {} woke up", self.procs.slot(s).pid);
                    self.sched.make_runnable(&mut self.procs, s);
                }
                Status::Blocked(_) => {
                    ipc::try_syscall(&mut self.hal, &mut self.procs, &mut self.sched, s);
                }
                _ => {}
            }
        }

        match self.sched.dequeue_highest() {
            Some(next) => self.dispatch(next),
            None => self.idle(),
        }
    }

    fn dispatch(&mut self, slot: usize) {
        let core = self.core_in_kernel;
        let now = self.hal.mtime_get();
        let pid = self.procs.slot(slot).pid;

        self.procs.set_on_core(core, slot);
        let mode = if pid >= GPID_USER_START {
            Privilege::User
        } else {
            Privilege::Machine
        };
        self.hal.set_return_privilege(mode);
        self.hal.mmu_switch(pid);
        self.hal.mmu_flush_cache();

        let pcb = self.procs.slot_mut(slot);
        if matches!(pcb.status, Status::Ready) {
            // First dispatch: argc/argv registers and the image entry.
            pcb.saved_registers.regs[0] = APPS_ARG;
            pcb.saved_registers.regs[1] = APPS_ARG + 4;
            pcb.mepc = APPS_ENTRY;
        }
        if pcb.stats.first_schedule_time == 0 {
            pcb.stats.first_schedule_time = now;
        }
        pcb.sched.last_schedule = now;
        let level = pcb.sched.level;
        pcb.status = Status::Running;

        self.hal.timer_reset(core);
        trace!(target: "sched", "core {} runs pid {} at level {}", core, pid, level);
    }

    /// Nothing is runnable: park the core until the next interrupt.
    fn idle(&mut self) {
        let core = self.core_in_kernel;
        self.procs.set_on_core(core, 0);
        self.hal.timer_reset(core);
        self.hal.enable_interrupts();
        trace!(target: "sched", "core {} idle", core);
        self.hal.wait_for_interrupt();
    }
}
