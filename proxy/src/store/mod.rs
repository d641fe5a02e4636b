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

//! The route table: a concurrently readable, dynamically updated mapping
//! of hostnames to routes, each referencing a live, reference-counted
//! service binding. This is the hard core the rest of the crate sits
//! around: the sync loop is the only writer, the proxy engine is a
//! reader, and the two never contend because lookups and mutation each
//! take their own lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use edge_core::Strng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use crate::discovery::{Discovery, ServiceHandle};
use crate::error::Error;

pub mod tls;

/// The durable payload stored under `<prefix>/<domain>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePayload {
	#[serde(rename = "Domain")]
	pub domain: String,
	/// Looked up against whichever [`crate::discovery::Discovery`] the
	/// table was built with. For the production `PollingDiscovery`, this
	/// must be a `host:port` string (see its docs); `StaticDiscovery`
	/// (tests, statically configured backends) accepts any key the
	/// caller populated it with.
	#[serde(rename = "Service")]
	pub service: String,
	#[serde(rename = "TLSCert", default)]
	pub tls_cert: String,
	#[serde(rename = "TLSKey", default)]
	pub tls_key: String,
}

/// One registered hostname. Holds a non-owning reference (by name) to its
/// service binding; the binding itself lives in `RouteTable::bindings`.
#[derive(Clone)]
pub struct Route {
	pub domain: Strng,
	pub service_name: Strng,
	pub keypair: Option<Arc<tls::KeyPair>>,
}

impl Route {
	/// A route with a keypair is servable over TLS; one without is plain
	/// HTTP only.
	pub fn is_tls(&self) -> bool {
		self.keypair.is_some()
	}
}

/// The live backend pool for one `service_name`, shared by every route
/// that names it.
pub struct ServiceBinding {
	pub name: Strng,
	pub refs: usize,
	handle: Arc<dyn ServiceHandle>,
}

impl ServiceBinding {
	pub fn addresses(&self) -> Vec<String> {
		self.handle.current_addresses()
	}
}

impl Drop for ServiceBinding {
	fn drop(&mut self) {
		self.handle.close();
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
	Add,
	Remove,
}

#[derive(Debug, Clone)]
pub struct Event {
	pub kind: EventKind,
	pub domain: Strng,
}

struct Inner {
	routes: HashMap<Strng, Route>,
	bindings: HashMap<Strng, ServiceBinding>,
}

/// The exact-match host -> route map, plus the service_name -> binding
/// map. Guarded by its own read/write lock so request-path lookups never
/// block on each other; a second, independent lock guards the observer
/// set so that subscriber churn can never block routing.
pub struct RouteTable {
	inner: RwLock<Inner>,
	observers: RwLock<broadcast::Sender<Event>>,
	discovery: Arc<dyn Discovery>,
}

impl RouteTable {
	pub fn new(discovery: Arc<dyn Discovery>) -> Arc<Self> {
		let (tx, _rx) = broadcast::channel(256);
		Arc::new(Self {
			inner: RwLock::new(Inner {
				routes: HashMap::new(),
				bindings: HashMap::new(),
			}),
			observers: RwLock::new(tx),
			discovery,
		})
	}

	/// Read-lock, exact lowercase host match. Never blocks a concurrent
	/// install/uninstall for longer than a map lookup.
	pub fn lookup(&self, host: &str) -> Option<(Route, Vec<String>)> {
		let host = host.to_ascii_lowercase();
		let inner = self.inner.read().unwrap();
		let route = inner.routes.get(host.as_str())?;
		let addrs = inner
			.bindings
			.get(&route.service_name)
			.map(|b| b.addresses())
			.unwrap_or_default();
		Some((route.clone(), addrs))
	}

	pub fn refs(&self, service: &str) -> Option<usize> {
		self.inner.read().unwrap().bindings.get(service).map(|b| b.refs)
	}

	/// Parses `payload`, creates or reuses the named service binding,
	/// installs the route, and fans the `add` event out to observers on a
	/// fresh task (after the write lock is released, so emission can
	/// never deadlock with a writer).
	#[instrument(skip(self, payload), fields(domain))]
	pub async fn install(self: &Arc<Self>, domain: &str, payload: &str) -> Result<(), Error> {
		let domain: Strng = Strng::from(domain.to_ascii_lowercase());
		let parsed: RoutePayload =
			serde_json::from_str(payload).map_err(|e| Error::BadCertificate(anyhow::anyhow!(e)))?;

		let keypair = if !parsed.tls_cert.is_empty() && !parsed.tls_key.is_empty() {
			Some(Arc::new(
				tls::KeyPair::parse(&parsed.tls_cert, &parsed.tls_key).map_err(Error::BadCertificate)?,
			))
		} else {
			None
		};
		let service_name: Strng = Strng::from(parsed.service.as_str());

		{
			let inner = self.inner.read().unwrap();
			if inner.routes.contains_key(&domain) {
				return Err(Error::DomainExists(domain.to_string()));
			}
		}

		// Resolve (or open) the service binding's discovery subscription
		// *before* taking the write lock: this is a suspension point and
		// the route-table lock must never be held across one.
		let needs_open = {
			let inner = self.inner.read().unwrap();
			!inner.bindings.contains_key(&service_name)
		};
		let opened = if needs_open {
			Some(
				self
					.discovery
					.open_service_set(&service_name)
					.await
					.map_err(|source| Error::DiscoveryError {
						service: service_name.to_string(),
						source,
					})?,
			)
		} else {
			None
		};

		{
			let mut inner = self.inner.write().unwrap();
			if inner.routes.contains_key(&domain) {
				return Err(Error::DomainExists(domain.to_string()));
			}
			match inner.bindings.get_mut(&service_name) {
				Some(binding) => binding.refs += 1,
				None => {
					let handle = opened.expect("binding missing implies we just opened one");
					inner.bindings.insert(
						service_name.clone(),
						ServiceBinding {
							name: service_name.clone(),
							refs: 1,
							handle,
						},
					);
				},
			}
			inner.routes.insert(
				domain.clone(),
				Route {
					domain: domain.clone(),
					service_name: service_name.clone(),
					keypair,
				},
			);
		}

		debug!(%domain, %service_name, "route installed");
		self.emit(EventKind::Add, domain);
		Ok(())
	}

	/// Removes `domain`; if its binding's refcount reaches zero, the
	/// discovery subscription is closed and the binding is dropped.
	#[instrument(skip(self), fields(domain))]
	pub fn uninstall(self: &Arc<Self>, domain: &str) -> Result<(), Error> {
		let domain: Strng = Strng::from(domain.to_ascii_lowercase());
		{
			let mut inner = self.inner.write().unwrap();
			let route = inner
				.routes
				.remove(&domain)
				.ok_or_else(|| Error::NoSuchDomain(domain.to_string()))?;
			if let Some(binding) = inner.bindings.get_mut(&route.service_name) {
				binding.refs -= 1;
				if binding.refs == 0 {
					inner.bindings.remove(&route.service_name);
				}
			}
		}
		debug!(%domain, "route uninstalled");
		self.emit(EventKind::Remove, domain);
		Ok(())
	}

	pub fn watch(&self) -> broadcast::Receiver<Event> {
		self.observers.read().unwrap().subscribe()
	}

	/// Drops every route and closes every live service binding's
	/// discovery subscription, regardless of refcount. Used only by
	/// `Close`; the table is unusable afterward.
	pub fn close_all(&self) {
		let mut inner = self.inner.write().unwrap();
		inner.routes.clear();
		inner.bindings.clear();
	}

	/// Dispatches an event on a fresh task, after any lock this call was
	/// triggered from has already been released.
	fn emit(&self, kind: EventKind, domain: Strng) {
		let tx = self.observers.read().unwrap().clone();
		tokio::spawn(async move {
			let _ = tx.send(Event { kind, domain });
		});
	}
}
