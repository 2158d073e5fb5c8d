//! Process-unique member identities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a simulation member.  Assigned from a process-wide monotonic
/// counter when the member's [`MemberCore`](crate::member::MemberCore) is
/// constructed; never reused, even across simulations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub u64);

/// Goods are members; bundles key their quantities by the good's member id.
pub type GoodId = MemberId;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl MemberId {
    /// Draws the next process-unique id.
    pub(crate) fn next() -> MemberId {
        MemberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = MemberId::next();
        let b = MemberId::next();
        let c = MemberId::next();
        assert!(a < b && b < c);
        assert_ne!(a, c);
    }
}
