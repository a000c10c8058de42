//! The Driver lifecycle (spec §4.8): open/resume → seed → run workers →
//! drain or interrupt → close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value as Json;
use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::fetcher::Fetcher;
use crate::model::{NewRequest, RunStatus};
use crate::rate_limiter::RateLimiter;
use crate::scheduler::{Scheduler, ValidatorFn};
use crate::speculation::SpeculationEngine;
use crate::step::StepRegistry;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Speculation(#[from] crate::speculation::SpeculationError),

    #[error("no entry function registered named {0}")]
    UnknownEntry(String),
}

/// A scraper-supplied seed function: given its param dict, returns the
/// initial Requests to enqueue (spec §4.8 run step 2).
pub type EntryFn = Arc<dyn Fn(&Json) -> Vec<NewRequest> + Send + Sync>;

/// The set of non-speculative entry points a scraping program provides.
/// Speculative entries are registered on the [`SpeculationEngine`] instead
/// and dispatched there by name (spec §4.6, §4.8).
#[derive(Clone, Default)]
pub struct EntryRegistry {
    entries: HashMap<String, EntryFn>,
}

impl EntryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&Json) -> Vec<NewRequest> + Send + Sync + 'static,
    ) {
        self.entries.insert(name.into(), Arc::new(f));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn invoke(&self, name: &str, params: &Json) -> Result<Vec<NewRequest>, LifecycleError> {
        self.entries
            .get(name)
            .map(|f| f(params))
            .ok_or_else(|| LifecycleError::UnknownEntry(name.to_string()))
    }
}

/// Owns the Store, Scheduler dependencies, and the stop signal for one
/// process lifetime (spec §4.8).
pub struct Driver {
    store: Store,
    config: Arc<Config>,
    step_registry: Arc<StepRegistry>,
    entry_registry: EntryRegistry,
    speculation: Option<Arc<SpeculationEngine>>,
    validators: HashMap<String, ValidatorFn>,
    fetcher: Arc<dyn Fetcher>,
    rate_limiter: Arc<RateLimiter>,
    stop_event: Arc<AtomicBool>,
}

impl Driver {
    /// Spec §4.8 open sequence: open/migrate the Store, init or rehydrate
    /// RunMetadata, reset in-progress rows on resume, load the rate limiter,
    /// and install signal handlers.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        config: Arc<Config>,
        scraper_name: &str,
        scraper_version: &str,
        invocation_params: Json,
        step_registry: StepRegistry,
        entry_registry: EntryRegistry,
        speculation: Option<SpeculationEngine>,
        validators: HashMap<String, ValidatorFn>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, LifecycleError> {
        let store = Store::open(&config.db_path).await?;
        store
            .init_run_metadata(
                scraper_name,
                scraper_version,
                &invocation_params,
                config.base_delay.as_millis() as i64,
                config.jitter,
                config.num_workers as i64,
                config.max_backoff_time.as_millis() as i64,
            )
            .await?;

        if config.resume {
            let reset = store.reset_in_progress_to_pending().await?;
            info!(reset, "resume: reset in_progress rows to pending");
        }

        let rate_limiter = Arc::new(RateLimiter::load(store.clone(), &config.rate_limiter).await?);

        let stop_event = Arc::new(AtomicBool::new(false));
        if config.install_signal_handlers {
            install_signal_handlers(stop_event.clone());
        }

        Ok(Self {
            store,
            config,
            step_registry: Arc::new(step_registry),
            entry_registry,
            speculation: speculation.map(Arc::new),
            validators,
            fetcher,
            rate_limiter,
            stop_event,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn stop_event(&self) -> Arc<AtomicBool> {
        self.stop_event.clone()
    }

    /// Spec §4.8 run sequence. `seed_params`: `None` means "missing" (run
    /// every entry and seed every speculation slot); `Some(vec![])` means
    /// "empty" (seed nothing); `Some(pairs)` dispatches exactly those named
    /// invocations.
    pub async fn run(&self, seed_params: Option<Vec<(String, Json)>>) -> Result<(), LifecycleError> {
        self.store.set_run_status(RunStatus::Running).await?;

        match seed_params {
            Some(pairs) => {
                for (name, params) in pairs {
                    self.dispatch_seed(&name, &params).await?;
                }
            }
            None => {
                let names: Vec<String> = self.entry_registry.names().map(str::to_string).collect();
                for name in names {
                    self.dispatch_seed(&name, &Json::Null).await?;
                }
                if let Some(engine) = &self.speculation {
                    engine.seed_all(&self.store).await?;
                }
            }
        }

        let scheduler = Scheduler::new(
            self.store.clone(),
            self.rate_limiter.clone(),
            self.fetcher.clone(),
            self.step_registry.clone(),
            self.speculation.clone(),
            self.validators.clone(),
            self.config.clone(),
            self.stop_event.clone(),
        );
        scheduler.run(self.config.num_workers).await;

        let final_status = if self.stop_event.load(Ordering::SeqCst) {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        };
        self.store.set_run_status(final_status).await?;
        Ok(())
    }

    /// Routes one named seed invocation to the Speculation Engine if it owns
    /// that name, otherwise to the plain `EntryRegistry` (spec §4.8 run step 2).
    async fn dispatch_seed(&self, name: &str, params: &Json) -> Result<(), LifecycleError> {
        if let Some(engine) = self.speculation.as_ref().filter(|e| e.has_entry(name)) {
            engine.seed_entry(&self.store, name).await?;
            return Ok(());
        }
        for fields in self.entry_registry.invoke(name, params)? {
            self.store.insert_request(fields).await?;
        }
        Ok(())
    }
}

/// Installs SIGINT/SIGTERM handlers that set `stop_event` (spec §4.8 open
/// step 5). Restoring the previous handlers on shutdown isn't meaningful for
/// a process about to exit, so this crate's "restore" step is simply letting
/// the spawned task end with the process.
fn install_signal_handlers(stop_event: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGINT handler");
                    return;
                }
            };
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigint.recv() => info!("SIGINT received, stopping"),
                _ = sigterm.recv() => info!("SIGTERM received, stopping"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("ctrl-c received, stopping");
        }
        stop_event.store(true, Ordering::SeqCst);
    });
}
