pub(crate) mod dispatch;
pub(crate) mod queue;

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub use queue::{PoolStats, QueueDepth};
pub(crate) use queue::{EventQueue, MaintenanceJob};

use crate::engine::EngineCore;

/// The two fixed-size worker pools pulling from the shared queue.
pub(crate) struct WorkerPools {
    handles: Vec<JoinHandle<()>>,
    execution: usize,
    maintenance: usize,
}

impl WorkerPools {
    pub(crate) fn spawn(core: Arc<EngineCore>, execution: usize, maintenance: usize) -> io::Result<Self> {
        let execution = execution.max(1);
        let maintenance = maintenance.max(1);
        let mut pools = Self { handles: Vec::with_capacity(execution + maintenance), execution, maintenance };
        for index in 0..execution {
            let worker = core.clone();
            let handle = thread::Builder::new().name(format!("script-exec-{index}")).spawn(move || {
                while let Some(event) = worker.queue.next_event() {
                    let item = event.item;
                    let not_before = worker.dispatch(event);
                    worker.queue.finish_event(item, not_before);
                }
            });
            pools.adopt(handle, &core)?;
        }
        for index in 0..maintenance {
            let worker = core.clone();
            let handle = thread::Builder::new().name(format!("script-maint-{index}")).spawn(move || {
                while let Some(job) = worker.queue.next_maintenance() {
                    match job {
                        MaintenanceJob::Lifecycle(item, request) => {
                            worker.run_lifecycle(item, request);
                            worker.queue.finish_lifecycle(item);
                        }
                        MaintenanceJob::Pass => {
                            worker.maintenance_pass();
                            worker.queue.finish_pass();
                        }
                    }
                }
            });
            pools.adopt(handle, &core)?;
        }
        tracing::debug!(execution, maintenance, "script worker pools started");
        Ok(pools)
    }

    fn adopt(&mut self, handle: io::Result<JoinHandle<()>>, core: &EngineCore) -> io::Result<()> {
        match handle {
            Ok(handle) => {
                self.handles.push(handle);
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn script worker thread");
                core.queue.shutdown();
                self.join();
                Err(err)
            }
        }
    }

    pub(crate) fn sizes(&self) -> (usize, usize) {
        (self.execution, self.maintenance)
    }

    /// Joins every worker. The queue must already be shut down.
    pub(crate) fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().map(str::to_string);
            if handle.join().is_err() {
                tracing::error!(worker = ?name, "script worker panicked");
            }
        }
    }
}
