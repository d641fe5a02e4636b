// Copyright the edge-router authors.
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

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use edge_proxy::coordination::EtcdClient;
use edge_proxy::discovery::PollingDiscovery;
use edge_proxy::{Config, EdgeRouter};
use edge_router::config::Args;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	let cfg = Args::parse().resolve()?;

	let store = Arc::new(EtcdClient::new(cfg.store_url.clone()));
	let discovery = Arc::new(PollingDiscovery::new(Duration::from_secs(10)));
	let router = EdgeRouter::new(store, discovery, cfg.prefix.clone());

	let (plain_addr, tls_addr) = router
		.start(Config {
			plain_addr: cfg.listen_http,
			tls_addr: cfg.listen_tls,
			drain_deadline: cfg.drain_deadline,
		})
		.await?;
	info!(%plain_addr, %tls_addr, store = %cfg.store_url, "edge-router ready");

	wait_for_shutdown_signal().await;
	info!("shutdown signal received, draining");
	router.close().await;
	info!("shutdown complete");
	Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
	use tokio::signal::unix::{SignalKind, signal};

	let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
	tokio::select! {
		_ = tokio::signal::ctrl_c() => {},
		_ = sigterm.recv() => {},
	}
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}
