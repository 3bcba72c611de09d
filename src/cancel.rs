use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide shutdown signal.
///
/// Multiple readers (sampler thread, orchestrator loops), one writer (the
/// `SIGINT`/`SIGTERM` handler installed in `main`). Plain atomic bool with
/// relaxed ordering: correctness only requires eventual visibility, never
/// a particular happens-before relationship with the data it guards (see
/// spec §9, "Global mutable state").
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Set exactly once per process lifetime; further calls are harmless.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
