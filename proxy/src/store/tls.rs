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

//! Parses a route's PEM cert/key into a usable `rustls::ServerConfig`.
//! The raw PEM bytes are discarded once parsed; only this opaque handle
//! is kept in the route table.

use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::transport::tls::{ALL_TLS_VERSIONS, provider};

pub struct KeyPair {
	pub server_config: Arc<ServerConfig>,
}

impl KeyPair {
	pub fn parse(cert_pem: &str, key_pem: &str) -> anyhow::Result<Self> {
		let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
			.collect::<Result<Vec<_>, _>>()?;
		if certs.is_empty() {
			anyhow::bail!("no certificates found in PEM");
		}
		let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
			.ok_or_else(|| anyhow::anyhow!("no private key found in PEM"))?;
		let key: PrivateKeyDer<'static> = key;

		let mut cfg = ServerConfig::builder_with_provider(provider())
			.with_protocol_versions(ALL_TLS_VERSIONS)?
			.with_no_client_auth()
			.with_single_cert(certs, key)?;
		cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
		Ok(Self {
			server_config: Arc::new(cfg),
		})
	}
}
