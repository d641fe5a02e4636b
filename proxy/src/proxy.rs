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

//! The HTTP/1 proxy engine. Once a route is identified for a connection,
//! this serves one or more request/response exchanges against a single
//! upstream connection, dialed once and reused across every request on
//! that client connection (the head-of-line coupling is a deliberate
//! simplicity trade-off, not an oversight).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use rand::seq::SliceRandom;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::store::{Route, RouteTable};
use crate::stream::Socket;

pub type Body = BoxBody<Bytes, hyper::Error>;

const ALLOWED_METHODS: &[Method] = &[
	Method::GET,
	Method::HEAD,
	Method::POST,
	Method::PUT,
	Method::DELETE,
	Method::OPTIONS,
	Method::TRACE,
];

fn empty_body() -> Body {
	Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn status_response(code: StatusCode) -> Response<Body> {
	Response::builder()
		.status(code)
		.body(empty_body())
		.expect("status-only response is always valid")
}

/// What this connection is allowed to route to, decided once: either
/// from the TLS SNI at accept time, or from the first plain-HTTP
/// request's Host header. Every later request on this connection, even
/// with a different Host header, is forwarded to the same upstream.
struct ConnState {
	route: Option<Route>,
	addrs: Vec<String>,
	sender: Option<SendRequest<Body>>,
}

struct ConnHandler {
	routes: Arc<RouteTable>,
	peer_addr: SocketAddr,
	is_tls: bool,
	state: AsyncMutex<ConnState>,
}

/// Serves a connection for which no route has been pre-selected (the
/// plain-HTTP listener): routing is decided from the first request's
/// Host header, returning 404 if it names no registered domain.
pub async fn serve_connection(routes: Arc<RouteTable>, socket: Socket) {
	serve_inner(routes, socket, None).await
}

/// Serves a connection whose route was already selected by SNI at TLS
/// accept time.
pub async fn serve_tls_connection(routes: Arc<RouteTable>, socket: Socket, route: Route) {
	let addrs = routes.lookup(&route.domain).map(|(_, a)| a).unwrap_or_default();
	serve_inner(routes, socket, Some((route, addrs))).await
}

async fn serve_inner(
	routes: Arc<RouteTable>,
	socket: Socket,
	preselected: Option<(Route, Vec<String>)>,
) {
	let peer_addr = socket.info.peer_addr;
	let is_tls = socket.info.tls;
	let (route, addrs) = match preselected {
		Some((r, a)) => (Some(r), a),
		None => (None, Vec::new()),
	};
	let handler = Arc::new(ConnHandler {
		routes,
		peer_addr,
		is_tls,
		state: AsyncMutex::new(ConnState {
			route,
			addrs,
			sender: None,
		}),
	});
	let io = TokioIo::new(socket);
	let service = service_fn(move |req| {
		let handler = handler.clone();
		async move { Ok::<_, Infallible>(handler.handle(req).await) }
	});
	if let Err(e) = http1::Builder::new()
		.serve_connection(io, service)
		.with_upgrades()
		.await
	{
		debug!(error = %e, peer = %peer_addr, "connection closed with error");
	}
}

impl ConnHandler {
	async fn handle(&self, req: Request<Incoming>) -> Response<Body> {
		if !ALLOWED_METHODS.contains(req.method()) {
			let err = ProxyError::MethodNotAllowed(req.method().clone());
			return status_response(err.status());
		}

		// Must be extracted from the original request object: the
		// server connection's upgrade hookup is tied to it specifically.
		let mut req = req;
		let client_upgrade = hyper::upgrade::on(&mut req);

		let mut state = self.state.lock().await;
		if state.route.is_none() {
			let host = match host_of(&req) {
				Some(h) => h,
				None => return status_response(StatusCode::BAD_REQUEST),
			};
			match self.routes.lookup(&host) {
				Some((route, addrs)) => {
					state.route = Some(route);
					state.addrs = addrs;
				},
				None => return status_response(StatusCode::NOT_FOUND),
			}
		}

		if state.sender.is_none() {
			match dial(&state.addrs).await {
				Ok(sender) => state.sender = Some(sender),
				Err(err) => return status_response(err.status()),
			}
		}

		let req = rewrite_request(req, self.peer_addr, self.is_tls);
		let sender = state.sender.as_mut().expect("just populated above");

		match sender.send_request(req).await {
			Ok(resp) if resp.status() == StatusCode::SWITCHING_PROTOCOLS => {
				handle_upgrade(resp, client_upgrade)
			},
			Ok(resp) => resp.map(|b| b.map_err(|e| e).boxed()),
			Err(e) => {
				// Upstream connection likely died between requests; the
				// next request on this client connection will redial.
				state.sender = None;
				let err = ProxyError::UpstreamIoError(e);
				warn!(error = %err, "upstream request failed");
				status_response(err.status())
			},
		}
	}
}

/// On a 101 response, the HTTP exchange is over for this connection:
/// reclaim the raw byte streams on both sides and tunnel until either
/// half closes. Returns the 101 response immediately so the server
/// connection can flush it and complete the client-side upgrade.
fn handle_upgrade(resp: Response<Incoming>, client_upgrade: OnUpgrade) -> Response<Body> {
	let mut resp = resp;
	let upstream_upgrade = hyper::upgrade::on(&mut resp);
	let (parts, _body) = resp.into_parts();
	tokio::spawn(async move {
		match (client_upgrade.await, upstream_upgrade.await) {
			(Ok(client_io), Ok(upstream_io)) => {
				let mut client_io = TokioIo::new(client_io);
				let mut upstream_io = TokioIo::new(upstream_io);
				if let Err(e) = copy_bidirectional(&mut client_io, &mut upstream_io).await {
					debug!(error = %e, "upgrade tunnel closed");
				}
			},
			_ => warn!("upgrade did not complete on one side of the connection"),
		}
	});
	Response::from_parts(parts, empty_body())
}

fn host_of(req: &Request<Incoming>) -> Option<String> {
	req
		.uri()
		.host()
		.map(|h| h.to_string())
		.or_else(|| {
			req
				.headers()
				.get(HOST)
				.and_then(|h| h.to_str().ok())
				.map(|h| h.to_string())
		})
		.map(|h| strip_port(&h).to_ascii_lowercase())
}

fn strip_port(host: &str) -> &str {
	if host.starts_with('[') {
		return host.split(']').next().unwrap_or(host);
	}
	host.split(':').next().unwrap_or(host)
}

fn rewrite_request(req: Request<Incoming>, peer: SocketAddr, is_tls: bool) -> Request<Body> {
	let mut req = req;
	*req.version_mut() = http::Version::HTTP_11;
	req.headers_mut().remove("te");
	req.headers_mut().remove("transfer-encoding");

	let client_ip = peer.ip().to_string();
	match req.headers_mut().entry("x-forwarded-for") {
		http::header::Entry::Vacant(e) => {
			e.insert(HeaderValue::from_str(&client_ip).expect("ip string is valid header value"));
		},
		http::header::Entry::Occupied(mut e) => {
			let folded = format!("{}, {}", e.get().to_str().unwrap_or(""), client_ip);
			e.insert(HeaderValue::from_str(&folded).expect("folded xff is valid header value"));
		},
	}
	req.headers_mut().insert(
		"x-forwarded-proto",
		HeaderValue::from_static(if is_tls { "https" } else { "http" }),
	);
	let start_ms = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis())
		.unwrap_or(0);
	req.headers_mut().insert(
		"x-request-start",
		HeaderValue::from_str(&start_ms.to_string()).expect("integer string is valid header value"),
	);

	req.map(|b| b.map_err(|e| e).boxed())
}

async fn dial(addrs: &[String]) -> Result<SendRequest<Body>, ProxyError> {
	if addrs.is_empty() {
		return Err(ProxyError::UpstreamUnavailable);
	}
	let mut order: Vec<&String> = addrs.iter().collect();
	order.shuffle(&mut rand::rng());
	for addr in order {
		let Ok(stream) = TcpStream::connect(addr).await else {
			continue;
		};
		let io = TokioIo::new(stream);
		let Ok((sender, conn)) = hyper::client::conn::http1::handshake(io).await else {
			continue;
		};
		tokio::spawn(async move {
			if let Err(e) = conn.with_upgrades().await {
				debug!(error = %e, "upstream connection task ended");
			}
		});
		return Ok(sender);
	}
	Err(ProxyError::UpstreamUnavailable)
}
