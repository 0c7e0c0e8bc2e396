// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;

use bridge::config::Config;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if config.wants_version() {
        println!("linuxio-bridge {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    match bridge::run::run(config).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}
