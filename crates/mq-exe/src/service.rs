//! Engine lifecycle
//!
//! A generation is one `start_all`: the scanned scripts, one thread per
//! script and the deadline scheduler. `stop_all` aborts and joins the whole
//! generation before anything new is started. Start, stop, reload and
//! shutdown all hold the lifecycle lock, so at most one generation exists.

use mq_bus::{Bus, SharedBus};
use mq_core::topics::{EXE_RELOAD, MATCH_ALL};
use mq_core::{decode, DevicePath, ValueRef};
use mq_store::Store;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::cache::ValueCache;
use crate::catalog::{devices_of, ScriptCatalog};
use crate::error::ExeResult;
use crate::globals::Globals;
use crate::runtime::{ScriptEnv, ScriptRuntime};
use crate::scheduler::TimeScheduler;
use crate::wait::WaitBroker;

struct Generation {
    scripts: Vec<(String, JoinHandle<()>)>,
    scheduler: TimeScheduler,
}

/// The rule engine
pub struct ExeService {
    bus: SharedBus,
    catalog: ScriptCatalog,
    broker: Arc<WaitBroker>,
    cache: Arc<ValueCache>,
    globals: Arc<Globals>,
    generation: Mutex<Option<Generation>>,
    lifecycle: Mutex<()>,
    reloading: AtomicBool,
    shut_down: AtomicBool,
}

impl ExeService {
    pub fn new(bus: SharedBus, store: Arc<Store>) -> ExeResult<Arc<Self>> {
        Ok(Arc::new(Self {
            bus,
            catalog: ScriptCatalog::new(store)?,
            broker: Arc::new(WaitBroker::new()),
            cache: Arc::new(ValueCache::new()),
            globals: Arc::new(Globals::new()),
            generation: Mutex::new(None),
            lifecycle: Mutex::new(()),
            reloading: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn catalog(&self) -> &ScriptCatalog {
        &self.catalog
    }

    pub fn cache(&self) -> &ValueCache {
        &self.cache
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn broker(&self) -> &WaitBroker {
        &self.broker
    }

    /// Names of the scripts whose threads are still running
    pub fn running(&self) -> Vec<String> {
        self.generation
            .lock()
            .as_ref()
            .map(|generation| {
                generation
                    .scripts
                    .iter()
                    .filter(|(_, handle)| !handle.is_finished())
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Scan the catalog, subscribe and start every script; returns how many started
    #[instrument(skip(self))]
    pub fn start_all(&self) -> ExeResult<usize> {
        let _lifecycle = self.lifecycle.lock();
        self.start_locked()
    }

    fn start_locked(&self) -> ExeResult<usize> {
        self.stop_locked();

        let scripts = self.catalog.load()?;
        let devices = devices_of(&scripts);

        self.bus.subscribe(EXE_RELOAD)?;
        for device in &devices {
            self.bus.subscribe(&device.status_topic())?;
        }
        info!(devices = devices.len(), "Subscribed to script values");

        let env = ScriptEnv {
            bus: Arc::clone(&self.bus),
            broker: Arc::clone(&self.broker),
            cache: Arc::clone(&self.cache),
            globals: Arc::clone(&self.globals),
            devices: Arc::new(devices),
        };

        let scheduler = TimeScheduler::start(Arc::clone(&self.broker))?;
        let mut threads = Vec::with_capacity(scripts.len());
        for script in &scripts {
            let runtime = match ScriptRuntime::compile(script, &env) {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(script = %script.name, error = %e, "Script not started");
                    continue;
                }
            };
            let spawned = thread::Builder::new()
                .name(format!("mq-script-{}", script.name))
                .spawn(move || runtime.run());
            match spawned {
                Ok(handle) => threads.push((script.name.clone(), handle)),
                Err(e) => error!(script = %script.name, error = %e, "Failed to spawn script thread"),
            }
        }

        let started = threads.len();
        *self.generation.lock() = Some(Generation {
            scripts: threads,
            scheduler,
        });
        info!(started, "Scripts started");
        Ok(started)
    }

    /// Abort every script and wait for the whole generation to finish
    #[instrument(skip(self))]
    pub fn stop_all(&self) {
        let _lifecycle = self.lifecycle.lock();
        self.stop_locked();
    }

    fn stop_locked(&self) {
        let Some(generation) = self.generation.lock().take() else {
            return;
        };

        if let Err(e) = self.bus.unsubscribe(MATCH_ALL) {
            warn!(error = %e, "Failed to drop subscriptions");
        }
        self.broker.abort_all();

        for (name, handle) in generation.scripts {
            if handle.join().is_err() {
                error!(script = %name, "Script thread panicked");
            } else {
                debug!(script = %name, "Script thread joined");
            }
        }
        generation.scheduler.stop();
        self.broker.reset();
        info!("Scripts stopped");
    }

    /// Stop everything for process exit; later reload requests are ignored
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.stop_all();
    }

    /// Restart all scripts on a separate thread
    ///
    /// Returns `None` when a reload is already running; the request is dropped.
    pub fn request_reload(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.reloading.swap(true, Ordering::SeqCst) {
            warn!("Reload already in progress, request dropped");
            return None;
        }

        let service = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("mq-exe-reload".to_string())
            .spawn(move || {
                service.reload();
                service.reloading.store(false, Ordering::SeqCst);
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "Failed to spawn reload thread");
                self.reloading.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    fn reload(&self) {
        let _lifecycle = self.lifecycle.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            debug!("Shutting down, reload skipped");
            return;
        }
        info!("Reloading scripts");
        if let Err(e) = self.start_locked() {
            error!(error = %e, "Reload failed");
        }
    }

    /// Bus callback: reload requests and value updates
    pub fn handle_message(self: &Arc<Self>, topic: &str, payload: &str) {
        if topic == EXE_RELOAD {
            self.request_reload();
            return;
        }

        let device = match DevicePath::from_status_topic(topic) {
            Some(Ok(device)) => device,
            Some(Err(e)) => {
                warn!(topic, error = %e, "Invalid status topic");
                return;
            }
            None => {
                trace!(topic, "Ignoring message");
                return;
            }
        };
        let message = match decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic, error = %e, payload, "Malformed envelope");
                return;
            }
        };

        for (name, reading) in message {
            let value = match ValueRef::new(device.clone(), name) {
                Ok(value) => value,
                Err(e) => {
                    warn!(topic, error = %e, "Invalid value name");
                    continue;
                }
            };
            if !self.cache.update(value.clone(), reading.value) {
                trace!(value = %value, "Unsupported payload type, not cached");
            }
            self.broker.notify_value(&value);
        }
    }
}
