// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
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

//! CA gateway server.
//!
//! # Usage
//!
//! ```text
//! ca-gateway [OPTIONS]
//!
//! Options:
//!   -c, --config <PATH>   Path to configuration file
//!   -v, --verbose         Log at DEBUG regardless of configuration
//!       --check           Validate configuration, load keys and exit
//!       --init <PATH>     Write a starting configuration file and exit
//!   -h, --help            Print help
//!   -V, --version         Print version
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use usg_ca_gateway::config::{ConfigLoader, write_default_config};
use usg_ca_gateway::logging::{self, LogLevel};

/// Multi-protocol certificate authority gateway
#[derive(Parser)]
#[command(name = "ca-gateway")]
#[command(author = "U.S. Federal Government")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "EST, SCEP, CMP and ACME front end for a certificate authority", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Write a starting configuration file and exit
    #[arg(long, value_name = "PATH", conflicts_with = "check")]
    init: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(path) = &cli.init {
        return match write_default_config(path) {
            Ok(()) => {
                println!("Wrote {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut log_config = config.log_config();
    if cli.verbose {
        log_config = log_config.with_level(LogLevel::Debug);
    }
    if let Err(e) = logging::init(&log_config) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let responder = Arc::new(config.build_responder()?);
        for (path, adapter) in responder.mounts() {
            tracing::info!("{} mounted at {}", adapter.protocol(), path);
        }

        if cli.check {
            println!("Configuration OK");
            return Ok(());
        }

        let addr = config.listen_addr()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("ca-gateway {} listening on {}", usg_ca_gateway::VERSION, addr);

        let serving = Arc::clone(&responder);
        axum::serve(listener, usg_ca_gateway::server::router(responder))
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        serving.signer_pool().close();
        tracing::info!("ca-gateway stopped");
        Ok::<(), Box<dyn std::error::Error>>(())
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
