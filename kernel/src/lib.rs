//! Core of a small multicore teaching operating system.
//!
//! This crate is the layer where hardware traps, scheduling policy,
//! process accounting and blocking system calls meet:
//!
//! - [`trap`]: the dispatcher; saves and restores process context,
//!   classifies the trap cause and drives the yield point.
//! - [`proc`]: the fixed-capacity process table with lifecycle statistics.
//! - [`mlfq`]: the multi-level feedback queue policy with periodic reset
//!   and the interactive shell boost.
//! - [`ipc`]: synchronous rendez-vous send/receive between processes.
//! - [`hal`]: the trait facade over the hardware layer (clock, timer,
//!   MMU, TTY, trap CSRs), with a machine-mode RISC-V backing.
//!
//! The kernel is cooperative internally: the platform's trap stub holds a
//! global lock from trap entry to mret, so one core at a time runs the
//! dispatcher and the core never suspends in kernel mode. Boot, the
//! hardware layer itself, user programs and the file system live outside
//! this crate.

#![cfg_attr(not(test), no_std)]

pub mod constants;
pub mod hal;
pub mod ipc;
pub mod klog;
pub mod lock;
pub mod mlfq;
pub mod proc;
pub mod trap;

pub use hal::{Platform, Privilege, TrapFrame};
pub use lock::Spinlock;
pub use proc::{Pcb, Pid, ProcTable, Status};
pub use trap::Kernel;
