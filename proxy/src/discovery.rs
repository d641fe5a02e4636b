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

//! Service discovery: the external collaborator that supplies the live
//! backend address set for a named service. The core only ever reads a
//! snapshot of this set; it never mutates it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

#[async_trait::async_trait]
pub trait Discovery: Send + Sync + 'static {
	/// Opens a subscription to the named service's address set. Fails if
	/// the service cannot be resolved at all.
	async fn open_service_set(&self, name: &str) -> anyhow::Result<Arc<dyn ServiceHandle>>;
}

/// A live handle on a service's address set. Dropping it (or calling
/// `close`) tears down whatever resolution loop backs it.
pub trait ServiceHandle: Send + Sync + 'static {
	/// A lock-free read of the current address set.
	fn current_addresses(&self) -> Vec<String>;
	fn close(&self);
}

/// Discovery backed by a fixed address list, handed out at construction.
/// Used in tests and for statically configured (`Opaque`) backends.
pub struct StaticDiscovery {
	services: std::collections::HashMap<String, Vec<String>>,
}

impl StaticDiscovery {
	pub fn new(services: std::collections::HashMap<String, Vec<String>>) -> Self {
		Self { services }
	}
}

struct StaticHandle(Vec<String>);

impl ServiceHandle for StaticHandle {
	fn current_addresses(&self) -> Vec<String> {
		self.0.clone()
	}
	fn close(&self) {}
}

#[async_trait::async_trait]
impl Discovery for StaticDiscovery {
	async fn open_service_set(&self, name: &str) -> anyhow::Result<Arc<dyn ServiceHandle>> {
		let addrs = self
			.services
			.get(name)
			.cloned()
			.ok_or_else(|| anyhow::anyhow!("no such static service: {name}"))?;
		Ok(Arc::new(StaticHandle(addrs)))
	}
}

/// Discovery that periodically re-resolves a DNS name and publishes the
/// resulting address list through a `watch` channel, so request handlers
/// can read the current snapshot without taking a lock.
///
/// The service name passed to `open_service_set` must be in `host:port`
/// form (e.g. `web.default.svc.cluster.local:8080`), the same shape a
/// route's `service` field needs when it is meant to be resolved this
/// way: `tokio::net::lookup_host` (and the `ToSocketAddrs` impl behind
/// it) only accepts that form, never a bare host name.
pub struct PollingDiscovery {
	interval: Duration,
}

impl PollingDiscovery {
	pub fn new(interval: Duration) -> Self {
		Self { interval }
	}
}

pub struct PollingHandle {
	rx: watch::Receiver<Vec<String>>,
	stop: Arc<tokio::sync::Notify>,
}

impl ServiceHandle for PollingHandle {
	fn current_addresses(&self) -> Vec<String> {
		self.rx.borrow().clone()
	}
	fn close(&self) {
		self.stop.notify_waiters();
	}
}

#[async_trait::async_trait]
impl Discovery for PollingDiscovery {
	async fn open_service_set(&self, name: &str) -> anyhow::Result<Arc<dyn ServiceHandle>> {
		let initial = resolve(name).await?;
		let (tx, rx) = watch::channel(initial);
		let stop = Arc::new(tokio::sync::Notify::new());
		let interval = self.interval;
		let name = name.to_string();
		let task_stop = stop.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = tokio::time::sleep(interval) => {},
					_ = task_stop.notified() => {
						debug!(service = %name, "discovery subscription closed");
						return;
					}
				}
				match resolve(&name).await {
					Ok(addrs) => {
						let _ = tx.send(addrs);
					},
					Err(e) => warn!(service = %name, error = %e, "re-resolution failed, keeping stale set"),
				}
				if tx.is_closed() {
					return;
				}
			}
		});
		Ok(Arc::new(PollingHandle { rx, stop }))
	}
}

/// Resolves `name`, which must already be in `host:port` form: that is
/// the convention `PollingDiscovery` requires of every route's `service`
/// field, since `tokio::net::lookup_host` (like the `ToSocketAddrs` impl
/// it wraps) rejects a portless host name outright.
async fn resolve(name: &str) -> anyhow::Result<Vec<String>> {
	if name.rsplit_once(':').is_none() {
		anyhow::bail!(
			"service name {name:?} is not in host:port form; PollingDiscovery requires a port \
			 (e.g. \"{name}:8080\") to resolve a service name via DNS"
		);
	}
	let addrs: Vec<String> = tokio::net::lookup_host(name)
		.await?
		.map(|a| a.to_string())
		.collect();
	Ok(addrs)
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn polling_discovery_resolves_an_ip_literal_host_port_name() {
		let discovery = PollingDiscovery::new(Duration::from_secs(3600));
		let handle = discovery.open_service_set("127.0.0.1:9000").await.unwrap();
		assert_eq!(handle.current_addresses(), vec!["127.0.0.1:9000".to_string()]);
		handle.close();
	}

	#[tokio::test]
	async fn polling_discovery_rejects_a_portless_service_name() {
		let discovery = PollingDiscovery::new(Duration::from_secs(3600));
		let err = discovery.open_service_set("web").await.unwrap_err();
		assert!(err.to_string().contains("host:port"), "unexpected error: {err}");
	}
}
