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

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

/// `edge-router`: a dynamically configured HTTP/HTTPS reverse proxy.
#[derive(Parser, Debug)]
#[command(name = "edge-router", version, about)]
pub struct Args {
	/// Optional YAML file providing defaults for any flag not given on
	/// the command line.
	#[arg(long)]
	pub config: Option<PathBuf>,

	#[arg(long)]
	pub listen_http: Option<SocketAddr>,

	#[arg(long)]
	pub listen_tls: Option<SocketAddr>,

	/// Base URL of the coordination store, e.g. `http://127.0.0.1:2379`.
	#[arg(long)]
	pub store_url: Option<String>,

	/// Key prefix under which routes are stored, e.g. `/routes`.
	#[arg(long)]
	pub prefix: Option<String>,

	/// Seconds to let in-flight connections finish after `Close`.
	#[arg(long)]
	pub drain_deadline_secs: Option<u64>,
}

/// The subset of [`Args`] that can also be supplied by a YAML file. CLI
/// flags take precedence over the file; the file's values fill in
/// anything the CLI left unset.
#[derive(Deserialize, Default)]
struct FileConfig {
	listen_http: Option<SocketAddr>,
	listen_tls: Option<SocketAddr>,
	store_url: Option<String>,
	prefix: Option<String>,
	drain_deadline_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Resolved {
	pub listen_http: SocketAddr,
	pub listen_tls: SocketAddr,
	pub store_url: String,
	pub prefix: String,
	pub drain_deadline: Duration,
}

impl Args {
	pub fn resolve(self) -> anyhow::Result<Resolved> {
		let file = match &self.config {
			Some(path) => {
				let text = std::fs::read_to_string(path)?;
				serde_yaml::from_str(&text)?
			},
			None => FileConfig::default(),
		};

		Ok(Resolved {
			listen_http: self
				.listen_http
				.or(file.listen_http)
				.unwrap_or_else(|| "0.0.0.0:8080".parse().unwrap()),
			listen_tls: self
				.listen_tls
				.or(file.listen_tls)
				.unwrap_or_else(|| "0.0.0.0:8443".parse().unwrap()),
			store_url: self
				.store_url
				.or(file.store_url)
				.ok_or_else(|| anyhow::anyhow!("store_url must be set via --store-url or the config file"))?,
			prefix: self.prefix.or(file.prefix).unwrap_or_else(|| "/routes".to_string()),
			drain_deadline: Duration::from_secs(
				self.drain_deadline_secs.or(file.drain_deadline_secs).unwrap_or(30),
			),
		})
	}
}
