// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    gang::scheduler::GangState,
    runtime::fail::Fail,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Condvar,
        Mutex,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// How long `shutdown` waits for the worker to acknowledge before abandoning
/// it.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Shared cancellation state between the worker and its owner.
struct Shutdown {
    /// Cooperative stop flag, signalled under `cond`.
    stop: Mutex<bool>,
    cond: Condvar,
    /// The worker observed the stop flag and is on its way out.
    exited: AtomicBool,
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown: Arc<Shutdown>,
}

/// The background rotation thread.
///
/// Every timeslice it locks the scheduler state, rotates each partition's
/// job list, and issues the resulting suspend/resume signals. The spawn and
/// terminate paths are serialized behind their own lock so a reconfiguring
/// controller cannot double-spawn the worker.
pub(crate) struct Timeslicer {
    worker: Mutex<Option<Worker>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Timeslicer {
    /// Spawns the rotation thread. A spawn failure is fatal at init and
    /// propagates to the caller.
    pub fn spawn(state: Arc<Mutex<GangState>>, timeslice: Duration) -> Result<Self, Fail> {
        let shutdown: Arc<Shutdown> = Arc::new(Shutdown {
            stop: Mutex::new(false),
            cond: Condvar::new(),
            exited: AtomicBool::new(false),
        });
        let worker_shutdown: Arc<Shutdown> = shutdown.clone();
        let handle: JoinHandle<()> = thread::Builder::new()
            .name("timeslicer".to_string())
            .spawn(move || {
                debug!("timeslicer: starting rotation loop");
                loop {
                    {
                        let mut guard = state.lock().expect("gang data lock poisoned");
                        guard.tick();
                    }
                    // Sleep one timeslice, or until shutdown wakes us.
                    let stop = worker_shutdown.stop.lock().expect("timeslicer stop lock poisoned");
                    let (stop, _) = worker_shutdown
                        .cond
                        .wait_timeout_while(stop, timeslice, |stop: &mut bool| !*stop)
                        .expect("timeslicer stop lock poisoned");
                    if *stop {
                        break;
                    }
                }
                worker_shutdown.exited.store(true, Ordering::Release);
                debug!("timeslicer: rotation loop exited");
            })
            .map_err(|_| Fail::new(libc::EAGAIN, "could not spawn timeslicer thread"))?;

        Ok(Self {
            worker: Mutex::new(Some(Worker { handle, shutdown })),
        })
    }

    /// Requests cooperative shutdown and waits a bounded time for the worker
    /// to acknowledge; a worker stuck past the deadline is abandoned with an
    /// error rather than blocking teardown forever.
    pub fn shutdown(&self) {
        let worker: Worker = match self.worker.lock().expect("timeslicer lifecycle lock poisoned").take() {
            Some(worker) => worker,
            None => return,
        };

        {
            let mut stop = worker.shutdown.stop.lock().expect("timeslicer stop lock poisoned");
            *stop = true;
        }
        worker.shutdown.cond.notify_all();

        let deadline: Instant = Instant::now() + SHUTDOWN_DEADLINE;
        while Instant::now() < deadline {
            if worker.shutdown.exited.load(Ordering::Acquire) {
                let _ = worker.handle.join();
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        error!("shutdown(): could not stop timeslicer thread; abandoning it");
    }
}
