//! In-memory build-log buffer keyed by pod.
//!
//! Lines for the current (or most recent) build of each pod. Cleared when a
//! new build starts; never persisted.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
pub struct BuildLogBuffer {
    inner: Arc<RwLock<HashMap<Uuid, Vec<String>>>>,
}

impl BuildLogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything recorded for `pod_id`.
    pub fn clear(&self, pod_id: Uuid) {
        let mut logs = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        logs.insert(pod_id, Vec::new());
    }

    pub fn append(&self, pod_id: Uuid, line: impl Into<String>) {
        let line = line.into();
        let mut logs = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        logs.entry(pod_id).or_default().push(line);
    }

    /// Copy of the current lines, safe to hold while writers keep appending.
    pub fn snapshot(&self, pod_id: Uuid) -> Vec<String> {
        let logs = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        logs.get(&pod_id).cloned().unwrap_or_default()
    }

    /// Line sink bound to one pod, handed to the container runtime's build step.
    pub fn sink(&self, pod_id: Uuid) -> impl Fn(String) + Send + Sync + 'static {
        let buffer = self.clone();
        move |line| buffer.append(pod_id, line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_snapshot_preserve_order() {
        let logs = BuildLogBuffer::new();
        let pod = Uuid::new_v4();
        logs.append(pod, "one");
        logs.append(pod, "two");
        assert_eq!(logs.snapshot(pod), vec!["one", "two"]);
        assert!(logs.snapshot(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn test_clear_only_affects_one_pod() {
        let logs = BuildLogBuffer::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        logs.append(a, "a");
        logs.append(b, "b");
        logs.clear(a);
        assert!(logs.snapshot(a).is_empty());
        assert_eq!(logs.snapshot(b), vec!["b"]);
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let logs = BuildLogBuffer::new();
        let pod = Uuid::new_v4();
        logs.append(pod, "first");
        let snap = logs.snapshot(pod);
        logs.append(pod, "second");
        assert_eq!(snap.len(), 1);
        assert_eq!(logs.snapshot(pod).len(), 2);
    }

    #[test]
    fn test_sink_appends_from_threads() {
        let logs = BuildLogBuffer::new();
        let pod = Uuid::new_v4();
        let sink = Arc::new(logs.sink(pod));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        sink(format!("{}-{}", i, j));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(logs.snapshot(pod).len(), 200);
    }
}
