//! Run-scoped deduplication.
//!
//! A [`DedupSet`] is created per crawl run and shared by reference between
//! executor workers. Keys are write-once and the set never shrinks while the
//! run lasts.

use dashmap::DashSet;

#[derive(Debug, Default)]
pub struct DedupSet {
    seen: DashSet<String>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically mark `id` as seen.
    ///
    /// Returns `false` for the first caller (proceed) and `true` for every
    /// later or concurrent caller (skip).
    pub fn check_and_mark(&self, id: &str) -> bool {
        !self.seen.insert(id.to_owned())
    }

    /// Read-only membership test; does not mark.
    pub fn is_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Compare a domain sample against what this run has already seen.
    pub fn sample<'a, I>(&self, ids: I) -> DomainSample
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut sample = DomainSample::default();
        for id in ids {
            sample.sampled += 1;
            if self.is_seen(id) {
                sample.seen += 1;
            }
        }
        sample
    }
}

/// Outcome of sampling a domain's most recent segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainSample {
    pub sampled: usize,
    pub seen: usize,
}

impl DomainSample {
    pub fn seen_ratio(&self) -> f64 {
        if self.sampled == 0 {
            0.0
        } else {
            self.seen as f64 / self.sampled as f64
        }
    }

    /// Skip the full crawl only when every sampled id was already seen.
    ///
    /// An empty sample proves nothing, so it never skips.
    pub fn is_mirror(&self) -> bool {
        self.sampled > 0 && self.seen == self.sampled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinSet;

    #[test]
    fn test_first_writer_wins() {
        let set = DedupSet::new();
        assert!(!set.check_and_mark("site:team:1"));
        assert!(set.check_and_mark("site:team:1"));
        assert!(!set.check_and_mark("site:team:2"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_instances_are_isolated() {
        let a = DedupSet::new();
        let b = DedupSet::new();
        a.check_and_mark("x");
        assert!(!b.is_seen("x"));
        assert!(!b.check_and_mark("x"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_marks_yield_one_unseen() {
        let set = Arc::new(DedupSet::new());
        let unseen = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for _ in 0..64 {
            let set = set.clone();
            let unseen = unseen.clone();
            tasks.spawn(async move {
                if !set.check_and_mark("site:tournament:42") {
                    unseen.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        assert_eq!(unseen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sampling_does_not_mark() {
        let set = DedupSet::new();
        let sample = set.sample(["a", "b"]);
        assert_eq!(sample, DomainSample { sampled: 2, seen: 0 });
        assert!(set.is_empty());
    }

    #[test]
    fn test_mirror_threshold_is_exact() {
        let set = DedupSet::new();
        let ids: Vec<String> = (0..100).map(|i| format!("id-{i}")).collect();
        for id in ids.iter().take(99) {
            set.check_and_mark(id);
        }

        let partial = set.sample(ids.iter().map(String::as_str));
        assert_eq!(partial.seen, 99);
        assert!(!partial.is_mirror());

        set.check_and_mark(&ids[99]);
        let full = set.sample(ids.iter().map(String::as_str));
        assert!(full.is_mirror());
        assert_eq!(full.seen_ratio(), 1.0);
    }

    #[test]
    fn test_empty_sample_is_not_a_mirror() {
        let sample = DedupSet::new().sample(std::iter::empty());
        assert!(!sample.is_mirror());
        assert_eq!(sample.seen_ratio(), 0.0);
    }
}
