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

//! SNI dispatch: peek the TLS ClientHello without consuming bytes the
//! TLS library will later re-read, look the SNI name up in the route
//! table, and only then complete the handshake with that route's
//! certificate. `LazyConfigAcceptor` buffers the peeked prefix and
//! replays it into the handshake itself, so byte-exactness of the
//! replay is the library's responsibility, not ours.

use std::sync::Arc;

use tracing::debug;

use crate::store::{Route, RouteTable};
use crate::stream::Socket;

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("no route for SNI name")]
	NoMatchingRoute,
	#[error("route has no TLS material")]
	RouteNotTls,
	#[error("tls handshake error: {0}")]
	Handshake(#[from] std::io::Error),
}

/// Peeks the ClientHello, looks up the SNI name against `routes`, and
/// completes the handshake with the matched route's certificate. Returns
/// `Err` (and the caller should simply close the connection, per spec:
/// there is no way to return an HTTP error before the handshake) when
/// there is no match or the matched route carries no TLS material.
pub async fn accept(routes: &Arc<RouteTable>, raw: Socket) -> Result<(Socket, Route), Error> {
	let (info, inner) = raw.into_parts();
	let acceptor =
		tokio_rustls::LazyConfigAcceptor::new(rustls::server::Acceptor::default(), inner);
	tokio::pin!(acceptor);
	let start = acceptor.as_mut().await?;
	let client_hello = start.client_hello();
	let sni = client_hello
		.server_name()
		.ok_or(Error::NoMatchingRoute)?
		.to_string();

	let (route, _addrs) = routes.lookup(&sni).ok_or(Error::NoMatchingRoute)?;
	let keypair = route.keypair.clone().ok_or(Error::RouteNotTls)?;

	debug!(sni = %sni, "tls handshake accepted");
	let tls = start.into_stream(keypair.server_config.clone()).await?;
	Ok((Socket::from_tls(info, tls), route))
}

/// Crypto provider restricted to the cipher suites this proxy's TLS
/// stack is confident in. FIPS-eligible AEAD suites only.
pub fn provider() -> Arc<rustls::crypto::CryptoProvider> {
	Arc::new(rustls::crypto::CryptoProvider {
		cipher_suites: vec![
			rustls::crypto::ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
			rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
		],
		..rustls::crypto::ring::default_provider()
	})
}
