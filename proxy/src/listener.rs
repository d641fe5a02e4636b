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

//! The listener pair: two bound TCP acceptors, one plain and one
//! TLS-bearing. Each accepted connection is dispatched to an independent
//! task; accept errors terminate that acceptor's loop, not the process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use edge_core::drain::{self, DrainWatcher};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::proxy;
use crate::store::RouteTable;
use crate::stream::Socket;
use crate::transport::tls as sni;

/// Binds a TCP listener, reads back its concrete address (so a `:0`
/// request yields the assigned port), and returns both.
pub async fn bind(addr: SocketAddr) -> std::io::Result<(TcpListener, SocketAddr)> {
	let listener = TcpListener::bind(addr).await?;
	let local = listener.local_addr()?;
	Ok((listener, local))
}

/// Runs the plain-HTTP acceptor: every connection is handed directly to
/// the proxy engine, which determines routing from the first request's
/// Host header.
pub async fn run_plain(listener: TcpListener, routes: Arc<RouteTable>, drain: DrainWatcher, deadline: Duration) {
	let accept = |drain: DrainWatcher, force_shutdown: watch::Receiver<()>| async move {
		loop {
			let (stream, peer) = match listener.accept().await {
				Ok(ok) => ok,
				Err(e) => {
					warn!(error = %e, "plain acceptor terminated");
					return;
				},
			};
			let routes = routes.clone();
			let drain = drain.clone();
			let mut force_shutdown = force_shutdown.clone();
			tokio::spawn(async move {
				debug!(peer = %peer, "plain connection accepted");
				let socket = match Socket::from_tcp(stream) {
					Ok(s) => s,
					Err(e) => {
						warn!(error = %e, "failed to prepare accepted socket");
						return;
					},
				};
				tokio::select! {
					_ = force_shutdown.changed() => {
						debug!(peer = %peer, "connection forcefully terminated");
					}
					_ = proxy::serve_connection(routes, socket) => {}
				}
				drop(drain);
			});
		}
	};
	drain::run_with_drain("plain-listener".to_string(), drain, deadline, accept).await;
}

/// Runs the TLS acceptor: every connection peeks its ClientHello for SNI
/// before any TLS handshake bytes are produced; an unmatched or
/// certificate-less route closes the connection silently.
pub async fn run_tls(listener: TcpListener, routes: Arc<RouteTable>, drain: DrainWatcher, deadline: Duration) {
	let accept = |drain: DrainWatcher, force_shutdown: watch::Receiver<()>| async move {
		loop {
			let (stream, peer) = match listener.accept().await {
				Ok(ok) => ok,
				Err(e) => {
					warn!(error = %e, "tls acceptor terminated");
					return;
				},
			};
			let routes = routes.clone();
			let drain = drain.clone();
			let mut force_shutdown = force_shutdown.clone();
			tokio::spawn(async move {
				debug!(peer = %peer, "tls connection accepted");
				let socket = match Socket::from_tcp(stream) {
					Ok(s) => s,
					Err(e) => {
						warn!(error = %e, "failed to prepare accepted socket");
						return;
					},
				};
				let handshake = async {
					match sni::accept(&routes, socket).await {
						Ok((tls_socket, route)) => {
							proxy::serve_tls_connection(routes, tls_socket, route).await;
						},
						Err(e) => {
							debug!(peer = %peer, error = %e, "tls handshake rejected, closing silently");
						},
					}
				};
				tokio::select! {
					_ = force_shutdown.changed() => {
						debug!(peer = %peer, "connection forcefully terminated");
					}
					_ = handshake => {}
				}
				drop(drain);
			});
		}
	};
	drain::run_with_drain("tls-listener".to_string(), drain, deadline, accept).await;
}
