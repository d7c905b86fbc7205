//! Commit batching for fan-out writes.

use crate::store::PersistenceSession;
use tracing::debug;

/// Issues a persistence commit every `size` recipient writes.
#[derive(Debug, Clone)]
pub struct CommitBatcher {
    size: usize,
    pending: usize,
    commits: usize,
}

impl CommitBatcher {
    pub fn new(size: usize) -> Self {
        CommitBatcher {
            size: size.max(1),
            pending: 0,
            commits: 0,
        }
    }

    /// Count one recipient write. Commits when the batch is full.
    pub fn record<S: PersistenceSession + ?Sized>(&mut self, session: &S) -> bool {
        self.pending += 1;
        if self.pending >= self.size {
            self.commit(session);
            return true;
        }
        false
    }

    /// Commit whatever is pending.
    pub fn flush<S: PersistenceSession + ?Sized>(&mut self, session: &S) -> bool {
        if self.pending == 0 {
            return false;
        }
        self.commit(session);
        true
    }

    fn commit<S: PersistenceSession + ?Sized>(&mut self, session: &S) {
        debug!(writes = self.pending, "commit batch");
        session.commit();
        self.pending = 0;
        self.commits += 1;
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Commits issued so far.
    pub fn commits(&self) -> usize {
        self.commits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackend;

    #[test]
    fn test_commits_every_batch_size() {
        let backend = InMemoryBackend::new();
        let mut batcher = CommitBatcher::new(3);
        let committed: Vec<bool> = (0..7).map(|_| batcher.record(&backend)).collect();
        assert_eq!(committed, vec![false, false, true, false, false, true, false]);
        assert_eq!(batcher.pending(), 1);
        assert!(batcher.flush(&backend));
        assert!(!batcher.flush(&backend));
        assert_eq!(batcher.commits(), 3);
        assert_eq!(backend.commits(), 3);
    }

    #[test]
    fn test_zero_size_commits_every_write() {
        let backend = InMemoryBackend::new();
        let mut batcher = CommitBatcher::new(0);
        assert!(batcher.record(&backend));
        assert!(batcher.record(&backend));
        assert_eq!(backend.commits(), 2);
    }
}
