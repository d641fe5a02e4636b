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

use http::StatusCode;

/// Errors surfaced to callers of the public API (`AddHTTPDomain`,
/// `RemoveHTTPDomain`, `Start`, `Close`, ...).
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("router is closed")]
	Closed,
	#[error("domain already exists: {0}")]
	DomainExists(String),
	#[error("no such domain: {0}")]
	NoSuchDomain(String),
	#[error("bad certificate: {0}")]
	BadCertificate(#[source] anyhow::Error),
	#[error("discovery failed for service {service}: {source}")]
	DiscoveryError {
		service: String,
		#[source]
		source: anyhow::Error,
	},
	#[error("coordination store error: {0}")]
	StoreError(#[from] crate::coordination::Error),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// Per-connection proxy errors. These never escape a single connection
/// handler; each one is turned into an HTTP response at the point it's
/// raised, since in this engine a `ProxyError` is only ever constructed
/// before a response has been sent to the client.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("no backend addresses available")]
	UpstreamUnavailable,
	#[error("upstream io error: {0}")]
	UpstreamIoError(#[source] hyper::Error),
	#[error("method not allowed: {0}")]
	MethodNotAllowed(http::Method),
}

impl ProxyError {
	/// The status code to return to the client for this error.
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
			ProxyError::UpstreamIoError(_) => StatusCode::BAD_GATEWAY,
		}
	}
}
