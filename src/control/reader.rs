//! Control Channel Reader
//!
//! Accepts control connections until shutdown, reads exactly one mapping
//! message from each and hands it to the manager. Nothing is written back.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{ControlConnection, ControlListener};
use crate::protocol::MappingRequest;
use crate::proxy::Manager;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub struct ControlReader {
    listener: ControlListener,
    manager: Arc<Manager>,
    max_message_bytes: usize,
}

impl ControlReader {
    pub fn new(listener: ControlListener, manager: Arc<Manager>, max_message_bytes: usize) -> Self {
        Self {
            listener,
            manager,
            max_message_bytes,
        }
    }

    /// Run the accept loop until `shutdown` flips to true or the listener goes away.
    ///
    /// Each connection is handled on its own task so a stuck sender cannot
    /// hold up later updates. Handlers still running when the loop exits are
    /// aborted, closing their connections.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Control channel listening on {}", self.listener);
        let mut handlers = JoinSet::new();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}

                accepted = self.listener.accept() => match accepted {
                    Ok(connection) => {
                        let manager = Arc::clone(&self.manager);
                        let limit = self.max_message_bytes;
                        handlers.spawn(handle_connection(connection, manager, limit));
                    }
                    Err(e) if is_listener_closed(&e) => {
                        info!("Control listener closed: {}", e);
                        break;
                    }
                    Err(e) => {
                        warn!("Control channel accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        if !handlers.is_empty() {
            debug!("Aborting {} unfinished control connection(s)", handlers.len());
        }
        handlers.shutdown().await;

        info!("Control channel on {} stopped", self.listener);
    }
}

fn is_listener_closed(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected)
}

async fn handle_connection(mut connection: ControlConnection, manager: Arc<Manager>, limit: usize) {
    let payload = match connection.read_message(limit).await {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Dropping control connection: {:#}", e);
            return;
        }
    };
    drop(connection);

    let request = match MappingRequest::decode(&payload) {
        Ok(request) => request,
        Err(e) => {
            warn!("Ignoring malformed port mapping ({} bytes): {:#}", payload.len(), e);
            return;
        }
    };

    debug!(
        remove = request.remove,
        entries = request.ports.len(),
        "Received port mapping"
    );
    let outcome = manager.apply(request).await;
    debug!("Port mapping applied: {}", outcome);
}
