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

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use clap::Command;
use log::error;

use cryptobak::config::ServerConfig;
use cryptobak::registry::sqlite::SqliteRegistry;
use cryptobak::registry::ClientRegistry;
use cryptobak::server::{Server, ServerSettings};

#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "debug";

#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "warn";

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(DEFAULT_LOG_LEVEL),
    )
    .init();

    let _ = Command::new("cryptobak-server")
        .about("Encrypted backup transfer server")
        .version(env!("CARGO_PKG_VERSION"))
        .get_matches();

    let config = match ServerConfig::load() {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load server configuration: {err}");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
    if let Err(err) = runtime.block_on(run(config)) {
        error!("server exited with error: {err}");
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.storage_dir)?;
    let db_uri = format!("sqlite://{}", config.registry_db_path.display());
    let registry: Arc<dyn ClientRegistry> = Arc::new(SqliteRegistry::new(&db_uri).await?);

    let settings = ServerSettings {
        bind_addr: config.bind_addr,
        max_sessions: config.max_sessions,
        idle_timeout: config.idle_timeout,
        shutdown_drain: config.shutdown_drain,
        storage_dir: config.storage_dir,
    };

    Arc::new(Server::new(settings, registry)).run().await
}
