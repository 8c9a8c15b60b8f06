//! Main Server (spec §4.J): reads configuration, builds components in
//! dependency order (couplers → publishers, since publishers may target a
//! coupler by name), starts them, and on SIGINT stops them in reverse
//! order. A second SIGINT forces a process exit (spec §6 "Exit codes").
//! Grounded on `generic_top_server.py`'s `GenericTopServer`
//! (`start`/`stop_server`/`stop_handler` sigint-count logic).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{ConfigError, RouterError};
use crate::router_core::coupler::{run_coupler, CouplerHandle, Sendable};
use crate::router_core::publisher::Publisher;
use crate::router_core::filter::FilterSet;
use crate::router_core::registry::{build_controller, build_coupler, build_filter, build_publisher};

struct RunningCoupler {
    name: String,
    stop_tx: mpsc::Sender<()>,
}

/// Owns every live coupler and publisher, in the order they were started,
/// so shutdown can walk them in reverse.
pub struct MainServer {
    config: Config,
    handle: CouplerHandle,
    couplers: Vec<RunningCoupler>,
    publishers: Vec<Arc<dyn Publisher>>,
    sigint_count: Arc<AtomicU32>,
}

impl MainServer {
    pub fn new(config: Config) -> Self {
        MainServer {
            config,
            handle: CouplerHandle::default(),
            couplers: Vec::new(),
            publishers: Vec::new(),
            sigint_count: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Build every configured application/coupler/publisher (spec §4.J build
    /// order: applications, then couplers, then publishers — a publisher's
    /// Injector kind targets a coupler by name, and a `DirectCanCoupler`
    /// needs the controller built before it can attach its writer to it).
    ///
    /// Each coupler is shared behind a lock rather than owned outright by
    /// its `run_coupler` task, so an `Injector` publisher can resolve its
    /// `target` against the same instance and deliver via `Coupler::send`.
    /// Every `DirectCanCoupler` shares the one `ActiveController` built from
    /// `config.applications`, so its sends are gated by address claim
    /// (spec §4.F "NotClaimed") instead of writing straight to the bus.
    pub async fn build(&mut self) -> Result<(), RouterError> {
        let mut sendable: HashMap<String, Arc<dyn Sendable>> = HashMap::new();

        let mut filters: HashMap<String, FilterSet> = HashMap::new();
        for entry in &self.config.filters {
            filters.insert(entry.name.clone(), build_filter(entry).map_err(RouterError::Config)?);
        }

        let controller = build_controller(&self.config.applications)
            .map_err(RouterError::Config)?
            .map(|c| Arc::new(tokio::sync::Mutex::new(c)));

        for entry in &self.config.couplers {
            let coupler = build_coupler(entry, controller.clone()).map_err(RouterError::Config)?;
            let shared = Arc::new(tokio::sync::Mutex::new(coupler));
            sendable.insert(entry.name.clone(), shared.clone() as Arc<dyn Sendable>);

            let (stop_tx, stop_rx) = mpsc::channel(1);
            let name = entry.name.clone();
            let handle = self.handle.clone();
            tokio::spawn(run_coupler(shared, handle, 5, Duration::from_secs(2), stop_rx));
            self.couplers.push(RunningCoupler { name, stop_tx });
        }

        for entry in &self.config.publishers {
            let publisher = build_publisher(entry, &sendable, &mut filters).await.map_err(RouterError::Config)?;
            self.handle.register(publisher.clone()).await;
            self.publishers.push(publisher);
        }

        Ok(())
    }

    pub fn start(&self) {
        info!(server = %self.config.server_name, couplers = self.couplers.len(), publishers = self.publishers.len(), "starting");
    }

    /// Stop every coupler (reverse of build order), then clear the
    /// publisher set. Idempotent — subsequent calls are no-ops.
    pub async fn stop(&mut self) {
        for running in self.couplers.drain(..).rev() {
            if running.stop_tx.send(()).await.is_err() {
                error!(coupler = %running.name, "stop signal dropped, coupler task already gone");
            }
        }
        self.publishers.clear();
    }

    /// Blocks until SIGINT, stops the server, and returns the process exit
    /// code: 0 for the first SIGINT, 1 if a second SIGINT arrives during
    /// shutdown (spec §6 "Exit codes").
    pub async fn run_until_signal(&mut self) -> i32 {
        if tokio::signal::ctrl_c().await.is_err() {
            return 1;
        }
        self.sigint_count.fetch_add(1, Ordering::SeqCst);
        info!("SIGINT received, stopping");

        let sigint_count = self.sigint_count.clone();
        let watchdog = tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if sigint_count.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                    error!("second SIGINT received, forcing exit");
                    std::process::exit(1);
                }
            }
        });

        self.stop().await;
        watchdog.abort();
        0
    }
}

pub fn validate_classes(config: &Config) -> Result<(), ConfigError> {
    for entry in &config.couplers {
        if !crate::router_core::registry::COUPLER_CLASSES.contains(&entry.class.as_str()) {
            return Err(ConfigError::UnknownClass(entry.class.clone()));
        }
    }
    for entry in &config.publishers {
        if !crate::router_core::registry::PUBLISHER_CLASSES.contains(&entry.class.as_str()) {
            return Err(ConfigError::UnknownClass(entry.class.clone()));
        }
    }
    for entry in &config.applications {
        if !crate::router_core::registry::APPLICATION_CLASSES.contains(&entry.class.as_str()) {
            return Err(ConfigError::UnknownClass(entry.class.clone()));
        }
    }
    Ok(())
}
