// Copyright 2025 rbgp Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;
use rbgp::config::Config;
use rbgp::log::{self, LogFormat, LogLevel};
use rbgp::server::BgpServer;
use rbgp::server_ops::to_json;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "rbgpd")]
#[command(about = "BGP speaker daemon", version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<LogLevel>,

    /// Print the peer table as JSON on shutdown
    #[arg(long)]
    dump_peers: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = Config::from_file(&args.config);
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => Config::default(),
    };

    let level = match args.log_level {
        Some(level) => level,
        None => config.log_level.parse().unwrap_or(LogLevel::Info),
    };
    let format = config.log_format.parse().unwrap_or(LogFormat::Text);
    log::init(level, format)?;

    if let Err(e) = &loaded {
        error!(path = %args.config, error = %e, "failed to load config, using defaults");
    }

    info!(
        listen_addr = %config.listen_addr,
        asn = config.asn,
        router_id = %config.router_id,
        peers = config.peers.len(),
        "starting BGP daemon"
    );

    let server = BgpServer::new(config)?;
    let handle = server.mgmt_handle();
    let mut server_task = tokio::spawn(server.run());

    tokio::select! {
        result = &mut server_task => {
            match result {
                Ok(Err(e)) => error!(error = %e, "BGP server error"),
                Err(e) => error!(error = %e, "BGP server task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            if args.dump_peers {
                match handle.get_peers().await {
                    Ok(peers) => match to_json(&peers, true) {
                        Ok(json) => println!("{}", json),
                        Err(e) => warn!(error = %e, "failed to encode peer table"),
                    },
                    Err(e) => warn!(error = %e, "failed to fetch peer table"),
                }
            }
            server_task.abort();
        }
    }

    Ok(())
}
