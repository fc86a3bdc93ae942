//! Reference-counted process-wide engine handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::engine::AudioEngine;
use crate::result::EngineError;

/// Shares one native engine between every stream in the process.
///
/// The first [`acquire`](SharedEngine::acquire) realizes the engine and the
/// last dropped [`EngineLease`] shuts it down again. Streams receive the
/// handle by injection, so tests can swap in a simulated engine.
pub struct SharedEngine {
    engine: Arc<dyn AudioEngine>,
    open_count: AtomicUsize,
    /// Serializes realize/shutdown against concurrent acquire/release.
    transition: Mutex<()>,
}

impl SharedEngine {
    pub fn new(engine: Arc<dyn AudioEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            open_count: AtomicUsize::new(0),
            transition: Mutex::new(()),
        })
    }

    /// Take a reference on the engine, realizing it if this is the first.
    pub fn acquire(self: &Arc<Self>) -> Result<EngineLease, EngineError> {
        let _guard = self.transition.lock();
        if self.open_count.load(Ordering::Acquire) == 0 {
            if let Err(err) = self.engine.realize() {
                error!(engine = self.engine.name(), result = err.as_str(), "engine realize failed");
                return Err(err);
            }
            info!(engine = self.engine.name(), "engine realized");
        }
        self.open_count.fetch_add(1, Ordering::AcqRel);
        Ok(EngineLease {
            shared: Arc::clone(self),
        })
    }

    /// Number of outstanding leases.
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::Acquire)
    }

    pub fn engine(&self) -> &Arc<dyn AudioEngine> {
        &self.engine
    }

    fn release(&self) {
        let _guard = self.transition.lock();
        if self.open_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.engine.shutdown();
            info!(engine = self.engine.name(), "engine shut down");
        }
    }
}

impl std::fmt::Debug for SharedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEngine")
            .field("engine", &self.engine.name())
            .field("open_count", &self.open_count())
            .finish()
    }
}

/// One reference on a [`SharedEngine`]. Dropping it releases the reference.
#[derive(Debug)]
pub struct EngineLease {
    shared: Arc<SharedEngine>,
}

impl EngineLease {
    pub fn engine(&self) -> &Arc<dyn AudioEngine> {
        self.shared.engine()
    }

    /// Release explicitly; same as dropping.
    pub fn release(self) {}
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        self.shared.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimEngine;

    #[test]
    fn first_acquire_realizes_last_release_shuts_down() {
        let sim = Arc::new(SimEngine::manual());
        let shared = SharedEngine::new(sim.clone());

        let a = shared.acquire().unwrap();
        let b = shared.acquire().unwrap();
        assert_eq!(shared.open_count(), 2);
        assert_eq!(sim.realize_count(), 1);

        drop(a);
        assert_eq!(sim.shutdown_count(), 0);
        b.release();
        assert_eq!(shared.open_count(), 0);
        assert_eq!(sim.shutdown_count(), 1);

        let _c = shared.acquire().unwrap();
        assert_eq!(sim.realize_count(), 2);
    }

    #[test]
    fn failed_realize_takes_no_reference() {
        let sim = Arc::new(SimEngine::manual());
        sim.set_fail_realize(true);
        let shared = SharedEngine::new(sim.clone());

        assert_eq!(shared.acquire().unwrap_err(), EngineError::ResourceError);
        assert_eq!(shared.open_count(), 0);
        assert_eq!(sim.shutdown_count(), 0);

        sim.set_fail_realize(false);
        let _lease = shared.acquire().unwrap();
        assert_eq!(shared.open_count(), 1);
    }
}
