use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Semaphore that can be switched off entirely; a limit of 0 means "no limit".
pub struct Semaphore {
    flag: AtomicBool,
    sem: Arc<tokio::sync::Semaphore>,
}

impl Semaphore {
    pub fn new() -> Self {
        let flag = AtomicBool::new(false);
        let sem = Arc::new(tokio::sync::Semaphore::new(0));
        Self { flag, sem }
    }

    pub fn setup(&self, value: usize) {
        self.flag.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    pub async fn acquire_owned(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        if self.flag.load(Ordering::Acquire) {
            // the semaphore is never closed, acquiring can only fail after close()
            self.sem.clone().acquire_owned().await.ok()
        } else {
            None
        }
    }

    pub fn available(&self) -> Option<usize> {
        if self.flag.load(Ordering::Acquire) {
            Some(self.sem.available_permits())
        } else {
            None
        }
    }
}
