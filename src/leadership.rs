//! Cluster leadership.
//!
//! Exactly one instance in a multi-instance deployment performs singleton
//! background work (bulk job reconciliation). The reconciler consults the
//! provider fresh at every tick rather than caching the answer, so a
//! leadership handoff takes effect within one tick interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Answers "does this instance currently hold leadership?".
pub trait LeadershipProvider: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Fixed leadership from configuration: the deployment designates one
/// leader node and the flag never changes for the process lifetime.
pub struct StaticLeadership {
    leader: bool,
}

impl StaticLeadership {
    pub fn new(leader: bool) -> Self {
        Self { leader }
    }
}

impl LeadershipProvider for StaticLeadership {
    fn is_leader(&self) -> bool {
        self.leader
    }
}

/// Leadership backed by a shared flag an external elector can flip at any
/// time (also the test harness).
#[derive(Clone, Default)]
pub struct SharedFlag {
    flag: Arc<AtomicBool>,
}

impl SharedFlag {
    pub fn new(leader: bool) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(leader)),
        }
    }

    pub fn set(&self, leader: bool) {
        self.flag.store(leader, Ordering::SeqCst);
    }
}

impl LeadershipProvider for SharedFlag {
    fn is_leader(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_leadership() {
        assert!(StaticLeadership::new(true).is_leader());
        assert!(!StaticLeadership::new(false).is_leader());
    }

    #[test]
    fn test_shared_flag_flips() {
        let flag = SharedFlag::new(false);
        assert!(!flag.is_leader());
        flag.set(true);
        assert!(flag.is_leader());
        flag.set(false);
        assert!(!flag.is_leader());
    }
}
