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

use clap::Command;
use log::{error, info};

use cryptobak::client::{transfer_file, TransferOutcome};
use cryptobak::config::ClientConfig;

#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "debug";

#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "warn";

/// Spec §6 deliberately gives this binary no functional flags: the
/// transfer is fully determined by this fixed-name config file and the
/// identity file next to it.
const CONFIG_FILE_NAME: &str = "cryptobak-client.conf";

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(DEFAULT_LOG_LEVEL),
    )
    .init();

    let _ = Command::new("cryptobak-client")
        .about("Encrypted backup transfer client")
        .version(env!("CARGO_PKG_VERSION"))
        .get_matches();

    let config_path = std::path::Path::new(CONFIG_FILE_NAME);
    let identity_path = cryptobak::client::identity::default_identity_path();

    let config = match ClientConfig::from_file(config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load client configuration: {err}");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
    let outcome = runtime.block_on(transfer_file(&config, &identity_path));

    match outcome {
        Ok(TransferOutcome::Done) => {
            info!("transfer completed and verified");
        }
        Ok(TransferOutcome::PermanentFailure(reason)) => {
            error!("transfer failed permanently: {reason}");
            std::process::exit(1);
        }
        Err(err) => {
            error!("transfer aborted: {err}");
            std::process::exit(1);
        }
    }
}
