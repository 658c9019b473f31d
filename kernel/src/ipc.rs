//! Synchronous rendez-vous message passing.
//!
//! SEND names a receiver pid; RECV names a sender pid or the `GPID_ALL`
//! wildcard. Both sides block until they match. Matching is level
//! triggered: every yield retries every blocked syscall, so only the
//! steady state matters, not the order the two sides arrived in.
//!
//! Completion is two-phase, mirroring the in-kernel record flow: a sender
//! that finds its receiver listening deposits the message into the
//! receiver's inbox and stays blocked; the next yield sees the filled
//! inbox, copies the completed record back to the receiver's user space
//! and wakes both sides.

use core::ptr;

use log::trace;
use static_assertions::const_assert_eq;

use crate::constants::{SYSCALL_ARG, SYSCALL_MSG_LEN};
use crate::hal::Platform;
use crate::mlfq::Mlfq;
use crate::proc::{BlockReason, Envelope, Pid, ProcTable, Status};

/// Wire value of a send request.
pub const SYS_SEND: u32 = 1;
/// Wire value of a receive request.
pub const SYS_RECV: u32 = 2;

/// Wire value of an in-flight syscall.
pub const SYSCALL_PENDING: u32 = 0;
/// Wire value of a completed syscall.
pub const SYSCALL_DONE: u32 = 1;

/// The syscall record every process keeps at `SYSCALL_ARG`.
///
/// Layout is shared with the user-space syscall stubs; changing it is an
/// ABI break.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct SyscallRecord {
    pub kind: u32,
    pub sender: Pid,
    pub receiver: Pid,
    pub status: u32,
    pub content: [u8; SYSCALL_MSG_LEN],
}

const_assert_eq!(
    core::mem::size_of::<SyscallRecord>(),
    16 + SYSCALL_MSG_LEN
);

impl SyscallRecord {
    pub const fn zeroed() -> Self {
        Self {
            kind: 0,
            sender: 0,
            receiver: 0,
            status: SYSCALL_PENDING,
            content: [0; SYSCALL_MSG_LEN],
        }
    }
}

/// Retry the blocked syscall of one slot, if it has one.
pub(crate) fn try_syscall<P: Platform>(
    hal: &mut P,
    procs: &mut ProcTable,
    sched: &mut Mlfq,
    slot: usize,
) {
    match &procs.slot(slot).status {
        Status::Blocked(BlockReason::SendingTo { .. }) => try_send(procs, slot),
        Status::Blocked(BlockReason::Receiving { .. }) => try_recv(hal, procs, sched, slot),
        _ => {}
    }
}

/// Deliver a pending send if its receiver is listening right now.
///
/// The sender stays blocked either way; it is woken together with the
/// receiver once the receiver's completion sweep runs. A send to a pid
/// that does not exist is an invariant break and halts the kernel.
pub(crate) fn try_send(procs: &mut ProcTable, slot: usize) {
    let (peer, sender_pid) = match &procs.slot(slot).status {
        Status::Blocked(BlockReason::SendingTo { peer, .. }) => (*peer, procs.slot(slot).pid),
        _ => return,
    };
    let Some(receiver_slot) = procs.slot_of(peer) else {
        panic!("try_send: unknown receiver pid={}", peer);
    };
    if receiver_slot == slot {
        // A process cannot rendez-vous with itself; it stays blocked.
        return;
    }

    let (sender, receiver) = procs.pair_mut(slot, receiver_slot);
    let msg = match &sender.status {
        Status::Blocked(BlockReason::SendingTo { msg, .. }) => *msg,
        _ => return,
    };
    if let Status::Blocked(BlockReason::Receiving { from, inbox }) = &mut receiver.status {
        if inbox.is_none() && from.admits(sender_pid) {
            *inbox = Some(Envelope {
                sender: sender_pid,
                msg,
            });
            trace!(target: "ipc", "send matched: {} -> {}", sender_pid, receiver.pid);
        }
    }
}

/// Complete a receive whose inbox has been filled.
///
/// Copies the finished record back to the receiver's user space and makes
/// both the receiver and the matched sender runnable.
pub(crate) fn try_recv<P: Platform>(
    hal: &mut P,
    procs: &mut ProcTable,
    sched: &mut Mlfq,
    slot: usize,
) {
    let (receiver_pid, envelope) = match &procs.slot(slot).status {
        Status::Blocked(BlockReason::Receiving {
            inbox: Some(envelope),
            ..
        }) => (procs.slot(slot).pid, *envelope),
        _ => return,
    };

    let record = SyscallRecord {
        kind: SYS_RECV,
        sender: envelope.sender,
        receiver: receiver_pid,
        status: SYSCALL_DONE,
        content: envelope.msg.0,
    };
    let paddr = hal.mmu_translate(receiver_pid, SYSCALL_ARG);
    // Safety: the platform guarantees SYSCALL_ARG maps a writable,
    // 4-byte-aligned syscall record in every process image.
    unsafe { ptr::write(paddr as *mut SyscallRecord, record) };

    sched.make_runnable(procs, slot);
    if let Some(sender_slot) = procs.slot_of(envelope.sender) {
        let sender_waiting = matches!(
            &procs.slot(sender_slot).status,
            Status::Blocked(BlockReason::SendingTo { peer, .. }) if *peer == receiver_pid
        );
        if sender_waiting {
            sched.make_runnable(procs, sender_slot);
        }
    }
    trace!(
        target: "ipc",
        "recv completed: {} got a message from {}",
        receiver_pid,
        envelope.sender
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockPlatform;
    use crate::proc::{Payload, SenderFilter, GPID_ALL};

    fn payload(text: &str) -> Payload {
        let mut body = Payload::zeroed();
        body.0[..text.len()].copy_from_slice(text.as_bytes());
        body
    }

    struct Fixture {
        hal: MockPlatform,
        procs: ProcTable,
        sched: Mlfq,
    }

    impl Fixture {
        fn new(nprocs: usize) -> Self {
            let mut procs = ProcTable::new();
            for _ in 0..nprocs {
                let (slot, _) = procs.alloc(0);
                procs.slot_mut(slot).status = Status::Runnable;
            }
            Self {
                hal: MockPlatform::new(),
                procs,
                sched: Mlfq::new(),
            }
        }

        fn block_send(&mut self, slot: usize, peer: Pid, text: &str) {
            self.procs.slot_mut(slot).status = Status::Blocked(BlockReason::SendingTo {
                peer,
                msg: payload(text),
            });
        }

        fn block_recv(&mut self, slot: usize, from: SenderFilter) {
            self.procs.slot_mut(slot).status =
                Status::Blocked(BlockReason::Receiving { from, inbox: None });
        }

        fn sweep(&mut self) {
            for slot in 1..=4 {
                try_syscall(&mut self.hal, &mut self.procs, &mut self.sched, slot);
            }
        }
    }

    #[test]
    fn rendez_vous_send_first() {
        let mut fx = Fixture::new(2);
        fx.block_send(1, 2, "hi there");
        fx.sweep();
        // No receiver yet: sender still blocked, nothing delivered.
        assert!(fx.procs.slot(1).status.is_blocked());

        fx.block_recv(2, SenderFilter::from_wire(GPID_ALL));
        fx.sweep();
        assert!(fx.procs.slot(1).status.is_schedulable());
        assert!(fx.procs.slot(2).status.is_schedulable());

        let record = fx.hal.user_record_mut(2);
        assert_eq!(record.kind, SYS_RECV);
        assert_eq!(record.status, SYSCALL_DONE);
        assert_eq!(record.sender, 1);
        assert_eq!(&record.content[..8], b"hi there");
    }

    #[test]
    fn rendez_vous_recv_first_is_equivalent() {
        let mut fx = Fixture::new(2);
        fx.block_recv(2, SenderFilter::from_wire(GPID_ALL));
        fx.sweep();
        assert!(fx.procs.slot(2).status.is_blocked());

        fx.block_send(1, 2, "hi there");
        fx.sweep();
        assert!(fx.procs.slot(1).status.is_schedulable());
        assert!(fx.procs.slot(2).status.is_schedulable());
        let record = fx.hal.user_record_mut(2);
        assert_eq!(record.sender, 1);
        assert_eq!(&record.content[..8], b"hi there");
    }

    #[test]
    fn payload_survives_the_round_trip_byte_for_byte() {
        let mut fx = Fixture::new(2);
        let mut body = Payload::zeroed();
        for (i, byte) in body.0.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        fx.procs.slot_mut(1).status = Status::Blocked(BlockReason::SendingTo {
            peer: 2,
            msg: body,
        });
        fx.block_recv(2, SenderFilter::Any);
        fx.sweep();

        let record = fx.hal.user_record_mut(2);
        for (i, byte) in record.content.iter().enumerate() {
            assert_eq!(*byte, (i % 251) as u8);
        }
    }

    #[test]
    fn specific_filter_rejects_other_senders() {
        let mut fx = Fixture::new(3);
        fx.block_recv(3, SenderFilter::From(2));
        fx.block_send(1, 3, "from one");
        fx.sweep();
        // Slot 1 (pid 1) is not admitted; everyone stays blocked.
        assert!(fx.procs.slot(1).status.is_blocked());
        assert!(fx.procs.slot(3).status.is_blocked());

        fx.block_send(2, 3, "from two");
        fx.sweep();
        assert!(fx.procs.slot(2).status.is_schedulable());
        assert!(fx.procs.slot(3).status.is_schedulable());
        assert_eq!(fx.hal.user_record_mut(3).sender, 2);
        // The first sender keeps waiting for a matching receive.
        assert!(fx.procs.slot(1).status.is_blocked());
    }

    #[test]
    fn second_sender_queues_behind_a_filled_inbox() {
        let mut fx = Fixture::new(3);
        fx.block_recv(3, SenderFilter::Any);
        fx.block_send(1, 3, "first");
        fx.block_send(2, 3, "second");
        // One retry pass: sender 1 fills the inbox, sender 2 must wait,
        // the receiver completes with sender 1.
        fx.sweep();
        assert!(fx.procs.slot(1).status.is_schedulable());
        assert!(fx.procs.slot(2).status.is_blocked());
        assert_eq!(fx.hal.user_record_mut(3).sender, 1);
    }

    #[test]
    #[should_panic(expected = "unknown receiver")]
    fn send_to_nonexistent_pid_is_fatal() {
        let mut fx = Fixture::new(1);
        fx.block_send(1, 42, "into the void");
        fx.sweep();
    }

    #[test]
    fn send_to_self_stays_blocked() {
        let mut fx = Fixture::new(1);
        fx.block_send(1, 1, "echo");
        fx.sweep();
        assert!(fx.procs.slot(1).status.is_blocked());
    }
}
