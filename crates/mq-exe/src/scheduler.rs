//! Deadline scheduler
//!
//! One thread per engine generation fires due deadlines every tick. It exits
//! on [`TimeScheduler::stop`] or once the broker starts aborting.

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::wait::WaitBroker;

/// Spacing between deadline checks
pub const TICK: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Shutdown {
    requested: Mutex<bool>,
    condvar: Condvar,
}

/// Handle to the running scheduler thread
pub struct TimeScheduler {
    shutdown: Arc<Shutdown>,
    handle: Option<JoinHandle<()>>,
}

impl TimeScheduler {
    pub fn start(broker: Arc<WaitBroker>) -> io::Result<Self> {
        let shutdown = Arc::new(Shutdown::default());
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("mq-exe-scheduler".to_string())
            .spawn(move || run(&broker, &thread_shutdown))?;
        debug!("Time scheduler started");
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        *self.shutdown.requested.lock() = true;
        self.shutdown.condvar.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Time scheduler thread panicked");
            }
            debug!("Time scheduler stopped");
        }
    }
}

impl Drop for TimeScheduler {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn run(broker: &WaitBroker, shutdown: &Shutdown) {
    loop {
        {
            let mut requested = shutdown.requested.lock();
            if !*requested {
                shutdown.condvar.wait_for(&mut requested, TICK);
            }
            if *requested {
                break;
            }
        }
        if broker.is_aborting() {
            trace!("Scheduler observed abort");
            break;
        }
        broker.fire_due(Utc::now());
    }
}
