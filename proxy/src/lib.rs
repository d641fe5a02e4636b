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

//! `edge-proxy`: a dynamically configured HTTP/HTTPS reverse proxy.
//! `EdgeRouter` is the crate's single public entrypoint, wiring the
//! route table, the config-sync loop against a coordination store, and
//! the plain/TLS listener pair behind the five operations admins and
//! tests actually call.

pub mod coordination;
pub mod discovery;
pub mod error;
pub mod listener;
pub mod proxy;
pub mod store;
pub mod stream;
pub mod sync;
pub mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edge_core::drain::{self, DrainMode, DrainTrigger};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

pub use crate::coordination::CoordinationStore;
pub use crate::discovery::Discovery;
pub use crate::error::Error;
pub use crate::store::{Event, RouteTable};

/// Listen addresses and coordination-store settings for [`EdgeRouter::start`].
#[derive(Debug, Clone)]
pub struct Config {
	pub plain_addr: SocketAddr,
	pub tls_addr: SocketAddr,
	/// How long in-flight connections get to finish after `Close` before
	/// being forcefully terminated.
	pub drain_deadline: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			plain_addr: "0.0.0.0:8080".parse().unwrap(),
			tls_addr: "0.0.0.0:8443".parse().unwrap(),
			drain_deadline: Duration::from_secs(30),
		}
	}
}

struct Running {
	drain_trigger: DrainTrigger,
	sync_stop: watch::Sender<()>,
	sync_task: tokio::task::JoinHandle<()>,
}

/// The reverse proxy's public entrypoint: `Start`/`Close` and the route
/// admin calls (`AddHTTPDomain`/`RemoveHTTPDomain`/`Watch`/`Unwatch`).
pub struct EdgeRouter {
	routes: Arc<RouteTable>,
	store: Arc<dyn CoordinationStore>,
	prefix: String,
	closed: AtomicBool,
	running: Mutex<Option<Running>>,
	observers: Mutex<HashMap<u64, tokio::task::JoinHandle<()>>>,
	next_observer_id: AtomicU64,
}

impl EdgeRouter {
	pub fn new(store: Arc<dyn CoordinationStore>, discovery: Arc<dyn Discovery>, prefix: impl Into<String>) -> Arc<Self> {
		Arc::new(Self {
			routes: RouteTable::new(discovery),
			store,
			prefix: prefix.into(),
			closed: AtomicBool::new(false),
			running: Mutex::new(None),
			observers: Mutex::new(HashMap::new()),
			next_observer_id: AtomicU64::new(0),
		})
	}

	/// Binds both listeners, runs the initial store snapshot, and starts
	/// the sync loop and both acceptors. Fails synchronously (releasing
	/// anything already bound) if the snapshot, the plain bind, or the
	/// TLS bind fails.
	pub async fn start(self: &Arc<Self>, cfg: Config) -> Result<(SocketAddr, SocketAddr), Error> {
		let (plain_listener, plain_addr) = listener::bind(cfg.plain_addr).await?;
		let (tls_listener, tls_addr) = match listener::bind(cfg.tls_addr).await {
			Ok(ok) => ok,
			Err(e) => {
				// plain_listener is dropped here, releasing the bound port.
				drop(plain_listener);
				return Err(Error::Io(e));
			},
		};

		let (ready_tx, ready_rx) = oneshot::channel();
		let (sync_stop_tx, sync_stop_rx) = watch::channel(());
		let sync_task = tokio::spawn(sync::run(
			self.routes.clone(),
			self.store.clone(),
			self.prefix.clone(),
			ready_tx,
			sync_stop_rx,
		));

		match ready_rx.await {
			Ok(Ok(())) => {},
			Ok(Err(e)) => {
				let _ = sync_stop_tx.send(());
				drop(plain_listener);
				drop(tls_listener);
				return Err(e);
			},
			Err(_) => {
				drop(plain_listener);
				drop(tls_listener);
				return Err(Error::Io(std::io::Error::other("sync loop exited before signaling ready")));
			},
		}

		let (drain_trigger, drain_watcher) = drain::new();
		let routes = self.routes.clone();
		let deadline = cfg.drain_deadline;
		tokio::spawn(listener::run_plain(plain_listener, routes, drain_watcher.clone(), deadline));
		let routes = self.routes.clone();
		tokio::spawn(listener::run_tls(tls_listener, routes, drain_watcher, deadline));

		*self.running.lock().unwrap() = Some(Running {
			drain_trigger,
			sync_stop: sync_stop_tx,
			sync_task,
		});

		info!(%plain_addr, %tls_addr, "edge router started");
		Ok((plain_addr, tls_addr))
	}

	/// Idempotent. Stops accepting new connections, lets in-flight ones
	/// finish up to the configured deadline, stops the sync loop, and
	/// closes every live service binding's discovery subscription.
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		let Some(running) = self.running.lock().unwrap().take() else {
			return;
		};
		let _ = running.sync_stop.send(());
		running.drain_trigger.start_drain_and_wait(DrainMode::Graceful).await;
		if let Err(e) = running.sync_task.await {
			warn!(error = %e, "sync task panicked during shutdown");
		}
		self.routes.close_all();
		for (_, handle) in self.observers.lock().unwrap().drain() {
			handle.abort();
		}
	}

	/// Writes a route to the coordination store; does not wait for the
	/// sync loop to apply it to the in-memory table.
	pub async fn add_http_domain(&self, domain: &str, service: &str, cert: &str, key: &str) -> Result<(), Error> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(Error::Closed);
		}
		let payload = store::RoutePayload {
			domain: domain.to_string(),
			service: service.to_string(),
			tls_cert: cert.to_string(),
			tls_key: key.to_string(),
		};
		let value = serde_json::to_string(&payload).expect("RoutePayload always serializes");
		let key = format!("{}/{}", self.prefix.trim_end_matches('/'), domain);
		self
			.store
			.create(&key, &value, None)
			.await
			.map_err(|e| if e.is_already_exists() {
				Error::DomainExists(domain.to_string())
			} else {
				Error::StoreError(e)
			})
	}

	/// Deletes a route from the coordination store; does not wait for
	/// the sync loop to apply it.
	pub async fn remove_http_domain(&self, domain: &str) -> Result<(), Error> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(Error::Closed);
		}
		let key = format!("{}/{}", self.prefix.trim_end_matches('/'), domain);
		self
			.store
			.delete(&key, false)
			.await
			.map_err(|e| if e.is_not_found() {
				Error::NoSuchDomain(domain.to_string())
			} else {
				Error::StoreError(e)
			})
	}

	/// Registers `sink` as an observer of add/remove events, returning a
	/// token to pass to [`EdgeRouter::unwatch`]. Forwarding happens on a
	/// dedicated task so a slow or stalled sink can never block the
	/// route table's emitter.
	pub fn watch(&self, sink: mpsc::Sender<Event>) -> u64 {
		let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
		let mut rx = self.routes.watch();
		let handle = tokio::spawn(async move {
			loop {
				match rx.recv().await {
					Ok(event) => {
						if sink.send(event).await.is_err() {
							return;
						}
					},
					Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
					Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
				}
			}
		});
		self.observers.lock().unwrap().insert(id, handle);
		id
	}

	/// Deregisters an observer. The forwarding task is cancelled
	/// immediately rather than joined, so a sink that nobody is reading
	/// from cannot block the caller.
	pub fn unwatch(&self, token: u64) {
		if let Some(handle) = self.observers.lock().unwrap().remove(&token) {
			handle.abort();
		}
	}

	pub fn route_table(&self) -> Arc<RouteTable> {
		self.routes.clone()
	}
}
