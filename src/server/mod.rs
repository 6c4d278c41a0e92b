/* This file is part of cryptobak.
 *
 * cryptobak is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * cryptobak is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with cryptobak.  If not, see <http://www.gnu.org/licenses/>.
 */

//! The server accept loop: binds a listener, bounds concurrency with a
//! semaphore, and hands each socket to a per-connection worker. Mirrors the
//! teacher's `AuthServer`/`FileServer` worker-spawn shape, with an added
//! admission semaphore and graceful-shutdown drain the teacher's servers
//! don't have (SPEC_FULL §2).

pub mod dispatch;
pub mod session;
pub mod storage;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::registry::ClientRegistry;

/// Server-wide settings resolved from [`crate::config::ServerConfig`].
pub struct ServerSettings {
    pub bind_addr: SocketAddr,
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub shutdown_drain: Duration,
    pub storage_dir: PathBuf,
}

/// The long-lived server value: the registry handle, storage root, and
/// concurrency knobs, constructed once at startup and shared by every
/// worker (spec §9: "replace globals with an explicit Server value").
pub struct Server {
    pub settings: ServerSettings,
    pub registry: Arc<dyn ClientRegistry>,
}

impl Server {
    pub fn new(settings: ServerSettings, registry: Arc<dyn ClientRegistry>) -> Self {
        Self { settings, registry }
    }

    /// Runs the accept loop until a ctrl-c signal is received, then drains
    /// in-flight workers up to `shutdown_drain` before returning.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.settings.bind_addr)
            .await
            .with_context(|| format!("binding {}", self.settings.bind_addr))?;
        info!("listening on {}", self.settings.bind_addr);

        let admission = Arc::new(Semaphore::new(self.settings.max_sessions));
        let mut workers = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!("accept failed: {err}");
                            continue;
                        }
                    };
                    let permit = admission.clone().acquire_owned().await
                        .expect("semaphore is never closed while the loop runs");
                    let server = self.clone();
                    workers.spawn(async move {
                        let _permit = permit;
                        if let Err(err) = dispatch::handle_connection(server, socket, peer).await {
                            warn!("connection {peer} ended with error: {err}");
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received, draining in-flight sessions");
                    break;
                }
            }
        }

        let drain = tokio::time::timeout(self.settings.shutdown_drain, async {
            while workers.join_next().await.is_some() {}
        });
        if drain.await.is_err() {
            error!("shutdown drain deadline exceeded, aborting remaining sessions");
            workers.shutdown().await;
        }
        Ok(())
    }
}
