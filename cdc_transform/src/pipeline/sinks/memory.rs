use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use super::{SinkError, SinkWriter};

/// In-memory object sink for tests and demos. Supports failure injection so
/// the retry and dead-letter paths can be exercised without a real store.
#[derive(Debug, Default)]
pub struct MemorySink {
    objects: Mutex<BTreeMap<String, Bytes>>,
    fail_transient: AtomicUsize,
    fail_permanent: AtomicBool,
    attempts: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` puts with a transient error.
    pub fn fail_next_transient(&self, n: usize) {
        self.fail_transient.store(n, Ordering::SeqCst);
    }

    /// Fail every following put with a permanent error.
    pub fn fail_permanent(&self) {
        self.fail_permanent.store(true, Ordering::SeqCst);
    }

    pub fn objects(&self) -> BTreeMap<String, Bytes> {
        self.objects.lock().unwrap().clone()
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn put_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SinkWriter for MemorySink {
    async fn put(&self, key: &str, body: Bytes) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.fail_permanent.load(Ordering::SeqCst) {
            return Err(SinkError::Permanent("injected permanent failure".to_string()));
        }
        if self
            .fail_transient
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SinkError::Transient("injected transient failure".to_string()));
        }

        info!(key, bytes = body.len(), "stored object");
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }
}
