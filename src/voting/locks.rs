use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::model::address::WalletAddress;

type Held = Arc<Mutex<HashSet<WalletAddress>>>;

fn lock(held: &Held) -> MutexGuard<'_, HashSet<WalletAddress>> {
    held.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The set of voters with a vote attempt in flight.
#[derive(Debug, Clone, Default)]
pub struct VoterLocks {
    held: Held,
}

impl VoterLocks {
    /// Take the lock for `voter`, or `None` if another attempt holds it.
    /// Never waits.
    pub fn try_acquire(&self, voter: WalletAddress) -> Option<VoterLock> {
        if !lock(&self.held).insert(voter) {
            return None;
        }
        Some(VoterLock {
            voter,
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, voter: &WalletAddress) -> bool {
        lock(&self.held).contains(voter)
    }
}

/// Exclusive right to cast a vote for one voter. Released on drop.
#[derive(Debug)]
pub struct VoterLock {
    voter: WalletAddress,
    held: Held,
}

impl VoterLock {
    pub fn voter(&self) -> &WalletAddress {
        &self.voter
    }
}

impl Drop for VoterLock {
    fn drop(&mut self) {
        lock(&self.held).remove(&self.voter);
    }
}
