//! Background maintenance.
//!
//! Each store owns one maintenance worker that periodically runs the
//! threshold compaction pass, keeping space reclaim off the request path.
//! The worker is cooperatively stopped and joined on store close.

use crate::error::CoreResult;
use crate::key::RecordKey;
use crate::segment::Compactor;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

struct ShutdownSignal {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Periodic background worker for one store.
pub struct MaintenanceWorker {
    shutdown: Arc<ShutdownSignal>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    /// Spawns the worker.
    pub fn spawn<K: RecordKey>(
        compactor: Arc<Compactor<K>>,
        interval: Duration,
    ) -> CoreResult<Self> {
        let shutdown = Arc::new(ShutdownSignal {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });

        let signal = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("chunkstore-maintenance".to_string())
            .spawn(move || loop {
                {
                    let mut stop = signal.stop.lock();
                    if !*stop {
                        signal.wake.wait_for(&mut stop, interval);
                    }
                    if *stop {
                        break;
                    }
                }

                let compacted = compactor.run_threshold_pass();
                if compacted > 0 {
                    debug!(segments = compacted, "maintenance pass compacted segments");
                }
            })?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Stops the worker and waits for it to exit.
    pub fn stop(&mut self) {
        *self.shutdown.stop.lock() = true;
        self.shutdown.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MaintenanceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceWorker")
            .field("running", &self.handle.is_some())
            .finish()
    }
}
