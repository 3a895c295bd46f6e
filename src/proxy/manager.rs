//! Forwarder Manager Implementation

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use anyhow::{anyhow, bail};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ConflictPolicy;
use crate::forwarder::{ForwarderInfo, ForwarderSettings, PortForwarder};
use crate::protocol::{Binding, MappingRequest, PortSpec};
use crate::Result;

/// What one mapping request did, entry by entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub started: Vec<PortSpec>,
    pub stopped: Vec<PortSpec>,
    /// Removes for specs that had no forwarder
    pub not_found: Vec<PortSpec>,
    /// Entries that failed (bind error, conflict, bad binding)
    pub skipped: Vec<PortSpec>,
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} started, {} stopped, {} not found, {} skipped",
            self.started.len(),
            self.stopped.len(),
            self.not_found.len(),
            self.skipped.len()
        )
    }
}

struct ForwarderTable {
    forwarders: HashMap<PortSpec, PortForwarder>,
    closed: bool,
}

/// Owns the table of active forwarders and applies mapping updates to it
pub struct Manager {
    listen_ip: IpAddr,
    on_conflict: ConflictPolicy,
    settings: ForwarderSettings,
    table: Mutex<ForwarderTable>,
}

impl Manager {
    pub fn new(listen_ip: IpAddr, on_conflict: ConflictPolicy, settings: ForwarderSettings) -> Self {
        Self {
            listen_ip,
            on_conflict,
            settings,
            table: Mutex::new(ForwarderTable {
                forwarders: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn listen_ip(&self) -> IpAddr {
        self.listen_ip
    }

    /// Apply every entry of `request` in declared order.
    ///
    /// A failing entry is logged and skipped; its siblings are still applied.
    pub async fn apply(&self, request: MappingRequest) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();

        for (spec, bindings) in request.ports {
            if request.remove {
                if self.remove(spec).await {
                    outcome.stopped.push(spec);
                } else {
                    debug!("No forwarder registered for {}, nothing to remove", spec);
                    outcome.not_found.push(spec);
                }
                continue;
            }

            match self.add(spec, &bindings).await {
                Ok(()) => outcome.started.push(spec),
                Err(e) => {
                    warn!("Skipping {}: {:#}", spec, e);
                    outcome.skipped.push(spec);
                }
            }
        }

        outcome
    }

    async fn remove(&self, spec: PortSpec) -> bool {
        let mut table = self.table.lock().await;
        match table.forwarders.remove(&spec) {
            Some(mut forwarder) => {
                forwarder.stop().await;
                true
            }
            None => false,
        }
    }

    async fn add(&self, spec: PortSpec, bindings: &[Binding]) -> Result<()> {
        let binding = bindings
            .first()
            .ok_or_else(|| anyhow!("no host binding given"))?;
        let upstream = binding.socket_addr()?;
        if bindings.len() > 1 {
            debug!("{} has {} bindings, forwarding to the first ({})", spec, bindings.len(), upstream);
        }

        {
            let mut table = self.table.lock().await;
            if table.closed {
                bail!("proxy is closed");
            }
            let existing = table.forwarders.get(&spec).map(PortForwarder::upstream);
            if let Some(existing) = existing {
                match self.on_conflict {
                    ConflictPolicy::Reject => {
                        bail!("already forwarded to {}", existing);
                    }
                    ConflictPolicy::Replace => {
                        // The binding is already validated; only the rebind below can still fail
                        if let Some(mut old) = table.forwarders.remove(&spec) {
                            info!("Replacing forwarder for {} ({} -> {})", spec, old.upstream(), upstream);
                            old.stop().await;
                        }
                    }
                }
            }
        }

        // Bind without holding the table lock
        let mut forwarder = PortForwarder::start(spec, self.listen_ip, upstream, self.settings.clone()).await?;

        let mut table = self.table.lock().await;
        if table.closed {
            drop(table);
            forwarder.stop().await;
            bail!("proxy closed while binding");
        }
        if table.forwarders.contains_key(&spec) {
            drop(table);
            forwarder.stop().await;
            bail!("a concurrent update registered this port first");
        }
        table.forwarders.insert(spec, forwarder);
        Ok(())
    }

    /// Stop every forwarder and refuse further adds. Safe to call more than once.
    pub async fn close_all(&self) {
        let mut table = self.table.lock().await;
        table.closed = true;

        let forwarders: Vec<PortForwarder> = table.forwarders.drain().map(|(_, f)| f).collect();
        let count = forwarders.len();
        for mut forwarder in forwarders {
            forwarder.stop().await;
        }
        if count > 0 {
            info!("Stopped {} forwarder(s)", count);
        }
    }

    /// Snapshot of every registered forwarder, ordered by port
    pub async fn forwarders(&self) -> Vec<ForwarderInfo> {
        let table = self.table.lock().await;
        let mut infos: Vec<ForwarderInfo> = table.forwarders.values().map(PortForwarder::info).collect();
        infos.sort_by_key(|info| info.spec);
        infos
    }

    pub async fn is_forwarding(&self, spec: PortSpec) -> bool {
        self.table.lock().await.forwarders.contains_key(&spec)
    }

    /// Actual bound address of the forwarder for `spec`
    pub async fn local_addr(&self, spec: PortSpec) -> Option<SocketAddr> {
        self.table.lock().await.forwarders.get(&spec).map(PortForwarder::local_addr)
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.forwarders.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
