//! Domain registry: the authoritative mapping from domain to live Service.
//!
//! The map is encapsulated here; the dispatcher and the control server only
//! get lookup, and all mutation flows through reconciliation.

use crate::config::{self, MapEntry};
use crate::ports;
use crate::service::{RunParams, Service, RESTART_DELAY};
use anyhow::Context;
use dashmap::DashMap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Snapshot of one service for the control plane's status listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatus {
    pub domain: String,
    pub port: Option<u16>,
    pub monitoring: bool,
    pub restarts: u64,
}

/// Owns all Services and reconciles them against the map file.
///
/// Returns `Arc<Self>` from the constructor because the registry is shared
/// across the proxy dispatcher, the control server and the watcher task.
pub struct Registry {
    services: DashMap<String, Arc<Service>>,
    restart_delay: Duration,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Self::with_restart_delay(RESTART_DELAY)
    }

    /// Like [`new`](Registry::new) with a custom crash-recovery delay for
    /// the services it creates.
    pub fn with_restart_delay(restart_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            services: DashMap::new(),
            restart_delay,
        })
    }

    /// Look up the Service for a domain.
    ///
    /// With `create` set, an absent domain gets a fresh Service registered
    /// under it. Reconciliation creates; the routing and reload paths must
    /// not, so a request for a never-configured domain stays a miss.
    pub fn service_for(&self, domain: &str, create: bool) -> Option<Arc<Service>> {
        if create {
            Some(self.ensure(domain))
        } else {
            self.services.get(domain).map(|s| Arc::clone(&s))
        }
    }

    fn ensure(&self, domain: &str) -> Arc<Service> {
        self.services
            .entry(domain.to_string())
            .or_insert_with(|| Service::with_restart_delay(domain, self.restart_delay))
            .clone()
    }

    /// Domains currently registered, in no particular order.
    pub fn domains(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.services
            .iter()
            .map(|e| {
                let service = e.value();
                ServiceStatus {
                    domain: e.key().clone(),
                    port: service.port(),
                    monitoring: service.is_monitoring(),
                    restarts: service.restarts(),
                }
            })
            .collect()
    }

    /// Apply configuration text to the registry.
    ///
    /// Entries are processed strictly in file order and fully sequentially:
    /// each entry's port allocation and service update (including any
    /// restart it triggers) completes before the next entry is touched.
    /// When an entry's derived run parameters are unchanged, the service
    /// keeps its existing port, so re-reading an identical file is a no-op.
    /// A port allocation failure skips that entry only.
    ///
    /// Domains absent from the new configuration are stopped and evicted.
    pub async fn reconcile(&self, text: &str) {
        let entries = config::parse_entries(text);
        let mut seen: HashSet<String> = HashSet::with_capacity(entries.len());

        for entry in &entries {
            seen.insert(entry.domain.clone());
            self.reconcile_entry(entry).await;
        }

        let stale: Vec<String> = self
            .services
            .iter()
            .filter(|e| !seen.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for domain in stale {
            if let Some((_, service)) = self.services.remove(&domain) {
                info!(domain = %domain, "Domain removed from configuration, stopping backend");
                service.shutdown();
            }
        }
    }

    async fn reconcile_entry(&self, entry: &MapEntry) {
        let (command, args, working_dir) = run_parameters(&entry.target);
        let service = self.ensure(&entry.domain);

        let port = if service.params_match(&command, &args, &working_dir) {
            service.port()
        } else {
            None
        };
        let port = match port {
            Some(port) => port,
            None => match ports::allocate_loopback().await {
                Ok(port) => port,
                Err(e) => {
                    error!(
                        domain = %entry.domain,
                        error = %e,
                        "Failed to allocate a port, skipping entry"
                    );
                    return;
                }
            },
        };

        debug!(domain = %entry.domain, port, target = %entry.target, "Reconciling domain");
        service.set_parameters(RunParams {
            command,
            args,
            working_dir,
            port,
        });
    }

    /// Read the map file and reconcile against its contents.
    pub async fn reconcile_file(&self, path: &Path) -> anyhow::Result<()> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read map file {}", path.display()))?;
        self.reconcile(&text).await;
        Ok(())
    }

    /// Perform an initial reconcile from `path`, then keep reconciling on
    /// every file change.
    ///
    /// The returned watcher must be kept alive for change events to keep
    /// flowing. The initial read is fatal; later read failures abort only
    /// that reconciliation attempt.
    pub async fn watch_map_file(
        self: &Arc<Self>,
        path: &Path,
    ) -> anyhow::Result<RecommendedWatcher> {
        self.reconcile_file(path).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        let _ = tx.send(());
                    }
                }
                Err(e) => error!(error = %e, "Map file watch error"),
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "Watching map file");

        let registry = Arc::clone(self);
        let path: PathBuf = path.to_path_buf();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                info!(path = %path.display(), "Map file changed, reconciling");
                if let Err(e) = registry.reconcile_file(&path).await {
                    error!(path = %path.display(), error = %e, "Failed to reload map file");
                }
            }
        });

        Ok(watcher)
    }

    /// Stop every supervised backend. Used on shutdown and in tests.
    pub fn shutdown_all(&self) {
        for entry in self.services.iter() {
            entry.value().shutdown();
        }
    }
}

/// Derive run parameters from a map entry's target.
///
/// A `.js` target runs under `node <basename>` from the script's directory;
/// anything else is executed directly with the target's directory as its
/// working directory.
fn run_parameters(target: &str) -> (String, Vec<String>, PathBuf) {
    let path = Path::new(target);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| target.to_string());

    if file.ends_with(".js") {
        ("node".to_string(), vec![file], dir)
    } else {
        (target.to_string(), Vec::new(), dir)
    }
}
