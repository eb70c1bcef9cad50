use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

/// A thread-team synchronization primitive: exactly one designated
/// participant (the leader) runs a block, every participant waits until it
/// is done, and all of them observe the value the leader published.
///
/// The timer core uses this to agree on node ids across a team: the leader
/// resolves a label to an id and publishes it to storage visible to the
/// whole team *before* the rendezvous; every participant reads the agreed
/// id from that storage *after* it. No participant may substitute a value
/// computed in a leader-only branch of its own.
pub trait Team {
    /// Number of participants in the team.
    fn size(&self) -> usize;

    /// Run `resolve` on the leader only and return its result to every
    /// participant. Blocks until the whole team has the value.
    fn agree(&self, resolve: impl FnOnce() -> usize) -> usize;
}

/// The one-participant team: `agree` just runs the closure inline.
///
/// Used by single-context sessions so the core can take a `Team`
/// unconditionally.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloTeam;

impl Team for SoloTeam {
    fn size(&self) -> usize {
        1
    }

    fn agree(&self, resolve: impl FnOnce() -> usize) -> usize {
        resolve()
    }
}

struct TeamShared {
    barrier: Barrier,
    slot: AtomicUsize,
    size: usize,
}

/// A fixed team of OS threads synchronized through `std::sync::Barrier`.
///
/// `group(n)` hands out one handle per participant; the handle with rank 0
/// is the leader. Handles are moved into their threads and reused for any
/// number of agreements.
pub struct BarrierTeam {
    shared: Arc<TeamShared>,
    rank: usize,
}

impl BarrierTeam {
    /// Create handles for a team of `size` participants. Rank 0 leads.
    pub fn group(size: usize) -> Vec<BarrierTeam> {
        let shared = Arc::new(TeamShared {
            barrier: Barrier::new(size),
            slot: AtomicUsize::new(0),
            size,
        });
        (0..size)
            .map(|rank| BarrierTeam {
                shared: Arc::clone(&shared),
                rank,
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }
}

impl Team for BarrierTeam {
    fn size(&self) -> usize {
        self.shared.size
    }

    fn agree(&self, resolve: impl FnOnce() -> usize) -> usize {
        if self.rank == 0 {
            self.shared.slot.store(resolve(), Ordering::Release);
        }
        self.shared.barrier.wait();
        let agreed = self.shared.slot.load(Ordering::Acquire);
        // Hold the slot stable until the whole team has read it; otherwise
        // a fast participant could enter the next agreement and overwrite
        // it before a slow one loads this value.
        self.shared.barrier.wait();
        agreed
    }
}
