//! Shared progress structure between the controller and its two workers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mysql_async::Value;

pub type ProgressRef = Arc<Progress>;

#[derive(Debug, Default)]
pub struct Progress {
    copied_rows: AtomicU64,
    copied_bytes: AtomicU64,
    chunks: AtomicU64,
    copy_done: AtomicBool,
    replayed_rows: AtomicU64,

    /// Upper PK bound of the last finished chunk.
    last_pk: Mutex<Option<Vec<Value>>>,
}

impl Progress {
    pub fn new() -> ProgressRef {
        Arc::new(Progress::default())
    }

    pub fn record_chunk(&self, rows: u64, bytes: u64) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.copied_rows.fetch_add(rows, Ordering::Relaxed);
        self.copied_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn copied_rows(&self) -> u64 {
        self.copied_rows.load(Ordering::Relaxed)
    }

    pub fn copied_bytes(&self) -> u64 {
        self.copied_bytes.load(Ordering::Relaxed)
    }

    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn set_copy_done(&self) {
        self.copy_done.store(true, Ordering::SeqCst);
    }

    pub fn is_copy_done(&self) -> bool {
        self.copy_done.load(Ordering::SeqCst)
    }

    pub fn add_replayed(&self, rows: u64) {
        self.replayed_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn replayed_rows(&self) -> u64 {
        self.replayed_rows.load(Ordering::Relaxed)
    }

    pub fn set_last_pk(&self, pk: Vec<Value>) {
        *self.last_pk.lock().unwrap() = Some(pk);
    }

    pub fn last_pk(&self) -> Option<Vec<Value>> {
        self.last_pk.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod test {
    use mysql_async::Value;

    use super::Progress;

    #[test]
    fn test_counters() {
        let p = Progress::new();
        p.record_chunk(500, 4096);
        p.record_chunk(123, 1024);
        assert_eq!(p.copied_rows(), 623);
        assert_eq!(p.copied_bytes(), 5120);
        assert_eq!(p.chunks(), 2);

        assert!(!p.is_copy_done());
        p.set_copy_done();
        assert!(p.is_copy_done());

        p.set_last_pk(vec![Value::Int(42)]);
        assert_eq!(p.last_pk(), Some(vec![Value::Int(42)]));
    }
}
