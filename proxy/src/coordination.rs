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

//! A client for the coordination store: a replicated, watchable key/value
//! store holding the durable form of every route. Modeled on etcd's v2 HTTP
//! API, since that is exactly the shape spec'd by the core: `create` /
//! `get(recursive)` / `delete(recursive)` / `watch(prefix, from_index)`,
//! with error codes 100 (key not found) and 105 (key already exists).

use std::time::Duration;

use async_stream::try_stream;
use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use futures_core::Stream;
use serde::Deserialize;
use tracing::{debug, warn};

pub const ERR_KEY_NOT_FOUND: u32 = 100;
pub const ERR_KEY_EXISTS: u32 = 105;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("etcd error {code}: {message}")]
	Store { code: u32, message: String },
	#[error("transport error: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("malformed response: {0}")]
	Decode(String),
}

impl Error {
	pub fn is_not_found(&self) -> bool {
		matches!(self, Error::Store { code, .. } if *code == ERR_KEY_NOT_FOUND)
	}

	pub fn is_already_exists(&self) -> bool {
		matches!(self, Error::Store { code, .. } if *code == ERR_KEY_EXISTS)
	}
}

/// A single node in the store's tree, as returned by `get` and `watch`.
#[derive(Debug, Clone)]
pub struct Node {
	pub key: String,
	pub value: Option<String>,
	pub modified_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	Set,
	Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
	pub action: Action,
	pub node: Node,
}

/// A snapshot of every key under a prefix, plus the logical index it was
/// read at. Further watches resume from `index + 1`.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
	pub nodes: Vec<Node>,
	pub index: u64,
}

/// The operations the core consumes from the coordination store. Kept as a
/// trait so tests can swap in an in-memory fake without a live etcd.
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
	async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error>;
	async fn get(&self, prefix: &str, recursive: bool) -> Result<Snapshot, Error>;
	async fn delete(&self, key: &str, recursive: bool) -> Result<(), Error>;
	fn watch(
		&self,
		prefix: String,
		from_index: u64,
		recursive: bool,
	) -> std::pin::Pin<Box<dyn Stream<Item = Result<WatchEvent, Error>> + Send>>;
}

/// etcd v2-style HTTP client.
#[derive(Clone)]
pub struct EtcdClient {
	base_url: String,
	http: reqwest::Client,
}

impl EtcdClient {
	pub fn new(base_url: impl Into<String>) -> Self {
		Self {
			base_url: base_url.into(),
			http: reqwest::Client::new(),
		}
	}

	fn key_url(&self, key: &str) -> String {
		format!("{}/v2/keys/{}", self.base_url.trim_end_matches('/'), key.trim_start_matches('/'))
	}
}

#[derive(Deserialize)]
struct EtcdErrorBody {
	#[serde(rename = "errorCode")]
	error_code: u32,
	message: String,
}

#[derive(Deserialize)]
struct EtcdNodeBody {
	key: String,
	value: Option<String>,
	dir: Option<bool>,
	#[serde(rename = "modifiedIndex")]
	modified_index: u64,
	nodes: Option<Vec<EtcdNodeBody>>,
}

impl EtcdNodeBody {
	fn flatten(self, out: &mut Vec<Node>) {
		if self.dir.unwrap_or(false) {
			for child in self.nodes.unwrap_or_default() {
				child.flatten(out);
			}
			return;
		}
		out.push(Node {
			key: self.key,
			value: self.value,
			modified_index: self.modified_index,
		});
	}
}

#[derive(Deserialize)]
struct EtcdResponseBody {
	action: String,
	node: EtcdNodeBody,
}

async fn classify(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
	if resp.status().is_success() {
		return Ok(resp);
	}
	let body: EtcdErrorBody = resp.json().await.map_err(|e| Error::Decode(e.to_string()))?;
	Err(Error::Store {
		code: body.error_code,
		message: body.message,
	})
}

#[async_trait::async_trait]
impl CoordinationStore for EtcdClient {
	async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
		let mut form = vec![("value".to_string(), value.to_string()), ("prevExist".to_string(), "false".to_string())];
		if let Some(ttl) = ttl {
			form.push(("ttl".to_string(), ttl.as_secs().to_string()));
		}
		let resp = self
			.http
			.put(self.key_url(key))
			.form(&form)
			.send()
			.await?;
		classify(resp).await?;
		Ok(())
	}

	async fn get(&self, prefix: &str, recursive: bool) -> Result<Snapshot, Error> {
		let resp = self
			.http
			.get(self.key_url(prefix))
			.query(&[("recursive", recursive.to_string())])
			.send()
			.await?;
		let resp = match classify(resp).await {
			Ok(resp) => resp,
			Err(e) if e.is_not_found() => {
				return Ok(Snapshot::default());
			},
			Err(e) => return Err(e),
		};
		let index = resp
			.headers()
			.get("x-etcd-index")
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.parse::<u64>().ok())
			.unwrap_or(0);
		let body: EtcdResponseBody = resp.json().await.map_err(|e| Error::Decode(e.to_string()))?;
		let mut nodes = Vec::new();
		body.node.flatten(&mut nodes);
		Ok(Snapshot { nodes, index })
	}

	async fn delete(&self, key: &str, recursive: bool) -> Result<(), Error> {
		let resp = self
			.http
			.delete(self.key_url(key))
			.query(&[("recursive", recursive.to_string())])
			.send()
			.await?;
		classify(resp).await?;
		Ok(())
	}

	fn watch(
		&self,
		prefix: String,
		from_index: u64,
		recursive: bool,
	) -> std::pin::Pin<Box<dyn Stream<Item = Result<WatchEvent, Error>> + Send>> {
		let client = self.clone();
		let stream = try_stream! {
			let mut wait_index = from_index;
			let mut backoff = ExponentialBackoffBuilder::new()
				.with_max_interval(Duration::from_secs(10))
				.with_max_elapsed_time(None)
				.build();
			loop {
				let resp = client
					.http
					.get(client.key_url(&prefix))
					.query(&[
						("wait", "true".to_string()),
						("waitIndex", wait_index.to_string()),
						("recursive", recursive.to_string()),
					])
					.send()
					.await;
				let resp = match resp {
					Ok(resp) => resp,
					Err(e) => {
						let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(10));
						warn!(error = %e, delay = ?delay, "watch request failed, retrying");
						tokio::time::sleep(delay).await;
						continue;
					},
				};
				let resp = match classify(resp).await {
					Ok(resp) => resp,
					Err(e) => {
						let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(10));
						warn!(error = %e, delay = ?delay, "watch response errored, retrying");
						tokio::time::sleep(delay).await;
						continue;
					},
				};
				backoff.reset();
				let body: EtcdResponseBody = resp.json().await.map_err(|e| Error::Decode(e.to_string()))?;
				wait_index = body.node.modified_index + 1;
				let action = match body.action.as_str() {
					"delete" | "expire" => Action::Delete,
					_ => Action::Set,
				};
				debug!(key = %body.node.key, ?action, index = wait_index, "watch event");
				let mut nodes = Vec::new();
				body.node.flatten(&mut nodes);
				for node in nodes {
					yield WatchEvent { action, node };
				}
			}
		};
		Box::pin(stream)
	}
}
