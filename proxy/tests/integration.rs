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

//! End-to-end scenarios from the core's testable-properties list, driven
//! against a real `EdgeRouter` with an in-memory coordination store, a
//! `wiremock` backend, and (for the TLS scenarios) a self-signed `rcgen`
//! keypair.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use edge_proxy::coordination::{Action, CoordinationStore, Error as StoreError, Node, Snapshot, WatchEvent};
use edge_proxy::discovery::StaticDiscovery;
use edge_proxy::transport::tls::{ALL_TLS_VERSIONS, provider};
use edge_proxy::{Config, EdgeRouter};
use futures_core::Stream;
use futures_util::StreamExt;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_stream::wrappers::BroadcastStream;

/// An in-memory stand-in for the etcd-v2-style coordination store,
/// implementing the same trait `EtcdClient` does, so `EdgeRouter` cannot
/// tell the difference. Backed by a broadcast channel so `watch` observes
/// every later `create`/`delete` without polling.
struct MemoryStore {
	entries: Mutex<HashMap<String, (String, u64)>>,
	index: AtomicU64,
	events: tokio::sync::broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
	fn new() -> Arc<Self> {
		let (events, _) = tokio::sync::broadcast::channel(256);
		Arc::new(Self {
			entries: Mutex::new(HashMap::new()),
			index: AtomicU64::new(0),
			events,
		})
	}
}

#[async_trait]
impl CoordinationStore for MemoryStore {
	async fn create(&self, key: &str, value: &str, _ttl: Option<Duration>) -> Result<(), StoreError> {
		let mut entries = self.entries.lock().unwrap();
		if entries.contains_key(key) {
			return Err(StoreError::Store {
				code: edge_proxy::coordination::ERR_KEY_EXISTS,
				message: format!("key already exists: {key}"),
			});
		}
		let idx = self.index.fetch_add(1, Ordering::SeqCst) + 1;
		entries.insert(key.to_string(), (value.to_string(), idx));
		let _ = self.events.send(WatchEvent {
			action: Action::Set,
			node: Node {
				key: key.to_string(),
				value: Some(value.to_string()),
				modified_index: idx,
			},
		});
		Ok(())
	}

	async fn get(&self, prefix: &str, _recursive: bool) -> Result<Snapshot, StoreError> {
		let entries = self.entries.lock().unwrap();
		let nodes = entries
			.iter()
			.filter(|(k, _)| k.starts_with(prefix))
			.map(|(k, (v, idx))| Node {
				key: k.clone(),
				value: Some(v.clone()),
				modified_index: *idx,
			})
			.collect();
		Ok(Snapshot {
			nodes,
			index: self.index.load(Ordering::SeqCst),
		})
	}

	async fn delete(&self, key: &str, _recursive: bool) -> Result<(), StoreError> {
		let mut entries = self.entries.lock().unwrap();
		if entries.remove(key).is_none() {
			return Err(StoreError::Store {
				code: edge_proxy::coordination::ERR_KEY_NOT_FOUND,
				message: format!("key not found: {key}"),
			});
		}
		let idx = self.index.fetch_add(1, Ordering::SeqCst) + 1;
		let _ = self.events.send(WatchEvent {
			action: Action::Delete,
			node: Node {
				key: key.to_string(),
				value: None,
				modified_index: idx,
			},
		});
		Ok(())
	}

	fn watch(
		&self,
		prefix: String,
		from_index: u64,
		_recursive: bool,
	) -> Pin<Box<dyn Stream<Item = Result<WatchEvent, StoreError>> + Send>> {
		let rx = self.events.subscribe();
		let stream = BroadcastStream::new(rx).filter_map(move |event| {
			let prefix = prefix.clone();
			async move {
				match event {
					Ok(ev) if ev.node.modified_index >= from_index && ev.node.key.starts_with(&prefix) => Some(Ok(ev)),
					_ => None,
				}
			}
		});
		Box::pin(stream)
	}
}

async fn start_router(services: HashMap<String, Vec<String>>) -> (Arc<EdgeRouter>, SocketAddr, SocketAddr) {
	let store = MemoryStore::new();
	let discovery = Arc::new(StaticDiscovery::new(services));
	let router = EdgeRouter::new(store, discovery, "/routes");
	let (plain_addr, tls_addr) = router
		.start(Config {
			plain_addr: "127.0.0.1:0".parse().unwrap(),
			tls_addr: "127.0.0.1:0".parse().unwrap(),
			drain_deadline: Duration::from_millis(500),
		})
		.await
		.expect("router starts");
	(router, plain_addr, tls_addr)
}

/// Admin writes land in the store asynchronously from the sync loop's
/// point of view; poll the table rather than assuming immediate effect.
async fn wait_for_route(router: &EdgeRouter, domain: &str) {
	for _ in 0..200 {
		if router.route_table().lookup(domain).is_some() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("route for {domain} never appeared in the table");
}

async fn wait_for_absence(router: &EdgeRouter, domain: &str) {
	for _ in 0..200 {
		if router.route_table().lookup(domain).is_none() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("route for {domain} was never removed from the table");
}

async fn plain_request(addr: SocketAddr, host: &str, method: Method, path: &str) -> (StatusCode, http::HeaderMap) {
	let uri = if method == Method::CONNECT {
		format!("{host}:80")
	} else {
		path.to_string()
	};
	let stream = TcpStream::connect(addr).await.unwrap();
	let io = TokioIo::new(stream);
	let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.unwrap();
	tokio::spawn(async move {
		let _ = conn.await;
	});
	let req = Request::builder()
		.method(method)
		.uri(uri)
		.header("host", host)
		.body(Empty::<Bytes>::new())
		.unwrap();
	let resp = sender.send_request(req).await.unwrap();
	let status = resp.status();
	let headers = resp.headers().clone();
	let _ = resp.into_body().collect().await;
	(status, headers)
}

#[tokio::test]
async fn add_serve_remove_over_plain_http() {
	let backend = wiremock::MockServer::start().await;
	let captured = Arc::new(Mutex::new(None));
	let captured2 = captured.clone();
	wiremock::Mock::given(wiremock::matchers::method("GET"))
		.and(wiremock::matchers::path("/"))
		.respond_with(move |req: &wiremock::Request| {
			*captured2.lock().unwrap() = Some(req.headers.clone());
			wiremock::ResponseTemplate::new(200)
		})
		.mount(&backend)
		.await;

	let mut services = HashMap::new();
	services.insert("web".to_string(), vec![backend.address().to_string()]);
	let (router, plain_addr, _tls_addr) = start_router(services).await;

	router.add_http_domain("a.example", "web", "", "").await.unwrap();
	wait_for_route(&router, "a.example").await;

	let (status, _) = plain_request(plain_addr, "a.example", Method::GET, "/").await;
	assert_eq!(status, StatusCode::OK);

	let headers = captured.lock().unwrap().take().expect("backend saw the request");
	assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
	assert!(headers.get("x-forwarded-for").is_some());
	assert!(headers.get("x-request-start").is_some());
	assert!(headers.get("te").is_none());
	assert!(headers.get("transfer-encoding").is_none());

	router.remove_http_domain("a.example").await.unwrap();
	wait_for_absence(&router, "a.example").await;

	let (status, _) = plain_request(plain_addr, "a.example", Method::GET, "/").await;
	assert_eq!(status, StatusCode::NOT_FOUND);

	router.close().await;
}

#[tokio::test]
async fn unknown_host_returns_404() {
	let (router, plain_addr, _tls_addr) = start_router(HashMap::new()).await;
	let (status, _) = plain_request(plain_addr, "nope.example", Method::GET, "/").await;
	assert_eq!(status, StatusCode::NOT_FOUND);
	router.close().await;
}

#[tokio::test]
async fn empty_backend_set_returns_503() {
	let mut services = HashMap::new();
	services.insert("empty".to_string(), Vec::new());
	let (router, plain_addr, _tls_addr) = start_router(services).await;

	router.add_http_domain("c.example", "empty", "", "").await.unwrap();
	wait_for_route(&router, "c.example").await;

	let (status, _) = plain_request(plain_addr, "c.example", Method::GET, "/").await;
	assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
	router.close().await;
}

#[tokio::test]
async fn connect_method_is_rejected() {
	let mut services = HashMap::new();
	services.insert("web".to_string(), vec!["127.0.0.1:1".to_string()]);
	let (router, plain_addr, _tls_addr) = start_router(services).await;
	router.add_http_domain("d.example", "web", "", "").await.unwrap();
	wait_for_route(&router, "d.example").await;

	let (status, _) = plain_request(plain_addr, "d.example", Method::CONNECT, "/").await;
	assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
	router.close().await;
}

#[tokio::test]
async fn duplicate_add_is_rejected_by_the_store() {
	let mut services = HashMap::new();
	services.insert("web".to_string(), vec!["127.0.0.1:1".to_string()]);
	let (router, _plain_addr, _tls_addr) = start_router(services).await;

	router.add_http_domain("d.example", "web", "", "").await.unwrap();
	let err = router.add_http_domain("d.example", "web", "", "").await.unwrap_err();
	assert!(matches!(err, edge_proxy::Error::DomainExists(_)));
	router.close().await;
}

#[tokio::test]
async fn shared_service_binding_refcounts_across_two_routes() {
	let mut services = HashMap::new();
	services.insert("web".to_string(), vec!["127.0.0.1:1".to_string()]);
	let (router, _plain_addr, _tls_addr) = start_router(services).await;

	router.add_http_domain("a.example", "web", "", "").await.unwrap();
	router.add_http_domain("b.example", "web", "", "").await.unwrap();
	wait_for_route(&router, "a.example").await;
	wait_for_route(&router, "b.example").await;
	assert_eq!(router.route_table().refs("web"), Some(2));

	router.remove_http_domain("a.example").await.unwrap();
	wait_for_absence(&router, "a.example").await;
	assert_eq!(router.route_table().refs("web"), Some(1));

	router.remove_http_domain("b.example").await.unwrap();
	wait_for_absence(&router, "b.example").await;
	assert_eq!(router.route_table().refs("web"), None);

	router.close().await;
}

#[tokio::test]
async fn switching_protocols_tunnels_raw_bytes_until_either_side_closes() {
	let backend_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let backend_addr = backend_listener.local_addr().unwrap();
	tokio::spawn(async move {
		let (mut sock, _) = backend_listener.accept().await.unwrap();
		let mut received = Vec::new();
		let mut chunk = [0u8; 4096];
		loop {
			let n = sock.read(&mut chunk).await.unwrap();
			received.extend_from_slice(&chunk[..n]);
			if received.ends_with(b"\r\n\r\n") {
				break;
			}
		}
		sock
			.write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
			.await
			.unwrap();
		let mut echo = [0u8; 4];
		sock.read_exact(&mut echo).await.unwrap();
		sock.write_all(&echo).await.unwrap();
	});

	let mut services = HashMap::new();
	services.insert("ws".to_string(), vec![backend_addr.to_string()]);
	let (router, plain_addr, _tls_addr) = start_router(services).await;
	router.add_http_domain("ws.example", "ws", "", "").await.unwrap();
	wait_for_route(&router, "ws.example").await;

	let stream = TcpStream::connect(plain_addr).await.unwrap();
	let io = TokioIo::new(stream);
	let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.unwrap();
	tokio::spawn(async move {
		let _ = conn.with_upgrades().await;
	});
	let req = Request::builder()
		.method(Method::GET)
		.uri("/chat")
		.header("host", "ws.example")
		.header("connection", "Upgrade")
		.header("upgrade", "websocket")
		.body(Empty::<Bytes>::new())
		.unwrap();
	let mut resp = sender.send_request(req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);

	let upgraded = hyper::upgrade::on(&mut resp).await.unwrap();
	let mut io = TokioIo::new(upgraded);
	io.write_all(b"ping").await.unwrap();
	let mut buf = [0u8; 4];
	io.read_exact(&mut buf).await.unwrap();
	assert_eq!(&buf, b"ping");

	router.close().await;
}

mod tls_scenario {
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
	use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

	/// Accepts any server certificate. Only ever used against a
	/// self-signed test keypair over loopback.
	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer,
			_intermediates: &[CertificateDer],
			_server_name: &ServerName,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			vec![
				SignatureScheme::RSA_PKCS1_SHA256,
				SignatureScheme::ECDSA_NISTP256_SHA256,
				SignatureScheme::RSA_PKCS1_SHA384,
				SignatureScheme::ECDSA_NISTP384_SHA384,
				SignatureScheme::RSA_PSS_SHA256,
				SignatureScheme::RSA_PSS_SHA384,
				SignatureScheme::RSA_PSS_SHA512,
				SignatureScheme::ED25519,
			]
		}
	}

	pub fn insecure_client_config(provider: std::sync::Arc<rustls::crypto::CryptoProvider>) -> ClientConfig {
		ClientConfig::builder_with_provider(provider)
			.with_protocol_versions(super::ALL_TLS_VERSIONS)
			.expect("protocol versions are supported by the provider")
			.dangerous()
			.with_custom_certificate_verifier(std::sync::Arc::new(NoVerifier))
			.with_no_client_auth()
	}
}

#[tokio::test]
async fn tls_sni_routes_to_the_matching_certificate() {
	let backend = wiremock::MockServer::start().await;
	wiremock::Mock::given(wiremock::matchers::method("GET"))
		.respond_with(wiremock::ResponseTemplate::new(200).set_body_string("secure"))
		.mount(&backend)
		.await;

	let cert = rcgen::generate_simple_self_signed(vec!["secure.example".to_string()]).unwrap();
	let cert_pem = cert.cert.pem();
	let key_pem = cert.key_pair.serialize_pem();

	let mut services = HashMap::new();
	services.insert("secure-web".to_string(), vec![backend.address().to_string()]);
	let (router, _plain_addr, tls_addr) = start_router(services).await;
	router
		.add_http_domain("secure.example", "secure-web", &cert_pem, &key_pem)
		.await
		.unwrap();
	wait_for_route(&router, "secure.example").await;

	let client_cfg = tls_scenario::insecure_client_config(provider());
	let connector = tokio_rustls::TlsConnector::from(Arc::new(client_cfg));
	let stream = TcpStream::connect(tls_addr).await.unwrap();
	let server_name = rustls::pki_types::ServerName::try_from("secure.example").unwrap();
	let mut tls = connector.connect(server_name, stream).await.expect("handshake succeeds");

	tls
		.write_all(b"GET / HTTP/1.1\r\nHost: secure.example\r\nConnection: close\r\n\r\n")
		.await
		.unwrap();
	let mut resp = Vec::new();
	tls.read_to_end(&mut resp).await.unwrap();
	let text = String::from_utf8_lossy(&resp);
	assert!(text.starts_with("HTTP/1.1 200"), "unexpected response: {text}");

	router.close().await;
}

#[tokio::test]
async fn tls_unknown_sni_closes_without_a_handshake() {
	let (router, _plain_addr, tls_addr) = start_router(HashMap::new()).await;

	let client_cfg = tls_scenario::insecure_client_config(provider());
	let connector = tokio_rustls::TlsConnector::from(Arc::new(client_cfg));
	let stream = TcpStream::connect(tls_addr).await.unwrap();
	let server_name = rustls::pki_types::ServerName::try_from("other.example").unwrap();
	let result = connector.connect(server_name, stream).await;
	assert!(result.is_err(), "handshake should never complete for an unregistered SNI name");

	router.close().await;
}
