//! Worker pool / slot accounting (spec.md §4.6, C6).
//!
//! spec.md describes a pool of forked child processes, each with a fixed
//! number of slots, descriptors passed over pipes, and a separate ack
//! pipe reporting free-slot counts back to the mother. This crate realizes
//! the mother process as a single async task and each "child" as a task
//! spawned against a [`tokio::sync::Semaphore`]-bounded pool (spec.md §0
//! re-architecture table): acquiring a permit is forking/claiming a slot;
//! holding the permit for the task's lifetime is "sent but not yet acked";
//! dropping it is the `FREESLOT_*` ack byte.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Which stage a pool serves (spec.md §2 "NEGOTIATE, REQUEST, IO").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Negotiate,
    Request,
    Io,
}

/// A bounded pool of capacity for one stage (spec.md §3 "WorkerSlot",
/// aggregated: spec.md §4.6 invariant "aggregate capacity = Σ (type-specific
/// slots per child × child count)" collapses, in this single-process
/// model, to one semaphore per stage whose total permit count is that sum).
#[derive(Clone)]
pub struct StagePool {
    kind: StageKind,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    sentc: Arc<AtomicU64>,
    /// Barefoot-UDP exclusivity (spec.md §4.6 "at most one UDP session per
    /// IO child"): true while some in-flight IO task on this pool is
    /// relaying a UDP association.
    udp_session_held: Arc<std::sync::atomic::AtomicBool>,
}

impl StagePool {
    pub fn new(kind: StageKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            sentc: Arc::new(AtomicU64::new(0)),
            udp_session_held: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots remaining (spec.md §3 `WorkerSlot.freec`, invariant
    /// `freec <= maxSlots(type)`).
    pub fn free_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn sent_count(&self) -> u64 {
        self.sentc.load(Ordering::Relaxed)
    }

    /// Attempts to claim a slot (spec.md §4.6 `next_child`). Returns a
    /// permit acting as the per-session "free slot" — dropping it is the
    /// `FREESLOT_*` ack (spec.md §4.6 `send_object`/`recv_ack`).
    ///
    /// For `StageKind::Io` with `needs_udp_exclusivity` set, refuses to
    /// hand out a slot while another UDP association already holds one on
    /// this pool (spec.md §4.6 barefoot-UDP exclusivity rule); the caller
    /// should treat this the same as "no free slots" and queue a saved
    /// object.
    pub fn try_claim(&self, needs_udp_exclusivity: bool) -> Option<WorkerSlot> {
        if needs_udp_exclusivity
            && self
                .udp_session_held
                .swap(true, Ordering::AcqRel)
        {
            return None;
        }
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.sentc.fetch_add(1, Ordering::Relaxed);
                Some(WorkerSlot {
                    permit,
                    holds_udp_exclusivity: needs_udp_exclusivity,
                    udp_session_held: if needs_udp_exclusivity {
                        Some(Arc::clone(&self.udp_session_held))
                    } else {
                        None
                    },
                })
            }
            Err(_) => {
                if needs_udp_exclusivity {
                    self.udp_session_held.store(false, Ordering::Release);
                }
                None
            }
        }
    }
}

/// Ownership of one unit of stage capacity for the lifetime of a task.
/// Dropping it releases the permit (spec.md GLOSSARY "Free slot").
pub struct WorkerSlot {
    permit: OwnedSemaphorePermit,
    holds_udp_exclusivity: bool,
    udp_session_held: Option<Arc<std::sync::atomic::AtomicBool>>,
}

impl WorkerSlot {
    pub fn holds_udp_exclusivity(&self) -> bool {
        self.holds_udp_exclusivity
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if let Some(flag) = &self.udp_session_held {
            flag.store(false, Ordering::Release);
        }
        // `permit` itself releases the semaphore slot on drop.
        let _ = &self.permit;
    }
}

/// Acknowledgement a stage reports back about a completed unit of work
/// (spec.md §4.6 `recv_ack`, §6 "Acknowledgements are single bytes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Nop,
    FreeSlotTcp,
    FreeSlotUdp,
    Eof,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_accounting_holds_at_quiescence() {
        let pool = StagePool::new(StageKind::Io, 4);
        assert_eq!(pool.free_slots(), 4);
        let a = pool.try_claim(false).unwrap();
        let b = pool.try_claim(false).unwrap();
        assert_eq!(pool.free_slots(), 2);
        drop(a);
        assert_eq!(pool.free_slots(), 3);
        drop(b);
        assert_eq!(pool.free_slots(), 4);
    }

    #[test]
    fn exhausted_pool_refuses_further_claims() {
        let pool = StagePool::new(StageKind::Negotiate, 1);
        let _slot = pool.try_claim(false).unwrap();
        assert!(pool.try_claim(false).is_none());
    }

    #[test]
    fn only_one_udp_session_per_io_pool_at_a_time() {
        let pool = StagePool::new(StageKind::Io, 8);
        let first = pool.try_claim(true).unwrap();
        assert!(pool.try_claim(true).is_none());
        // A non-UDP claim is unaffected by the exclusivity flag.
        assert!(pool.try_claim(false).is_some());
        drop(first);
        assert!(pool.try_claim(true).is_some());
    }
}
