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

//! The config-sync loop: the bidirectional bridge between the
//! coordination store and the in-memory route table. It is the table's
//! only writer; admin calls only ever touch the store, never the
//! table directly, so state converges to store order.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::coordination::{Action, CoordinationStore};
use crate::store::RouteTable;

/// Runs the snapshot-then-watch loop until `stop` fires. `ready` is
/// fired once after the initial snapshot has been fully applied (or
/// failed), mirroring `Start`'s synchronous-failure contract.
pub async fn run(
	routes: Arc<RouteTable>,
	store: Arc<dyn CoordinationStore>,
	prefix: String,
	ready: oneshot::Sender<Result<(), crate::error::Error>>,
	mut stop: watch::Receiver<()>,
) {
	let snapshot = match store.get(&prefix, true).await {
		Ok(s) => s,
		Err(e) if e.is_not_found() => Default::default(),
		Err(e) => {
			let _ = ready.send(Err(crate::error::Error::StoreError(e)));
			return;
		},
	};

	for node in &snapshot.nodes {
		let Some(domain) = last_segment(&node.key) else {
			continue;
		};
		let Some(value) = &node.value else { continue };
		if let Err(e) = routes.install(domain, value).await {
			warn!(%domain, error = %e, "snapshot route failed to install, skipping");
		}
	}

	info!(index = snapshot.index, routes = snapshot.nodes.len(), "initial snapshot applied");
	if ready.send(Ok(())).is_err() {
		return;
	}

	let mut events = store.watch(prefix.clone(), snapshot.index + 1, true);
	loop {
		tokio::select! {
			_ = stop.changed() => {
				info!("config sync stopping");
				return;
			}
			event = events.next() => {
				let Some(event) = event else {
					error!("watch stream ended unexpectedly");
					std::process::abort();
				};
				let event = match event {
					Ok(event) => event,
					Err(e) => {
						error!(error = %e, "watch stream errored");
						std::process::abort();
					},
				};
				let Some(domain) = last_segment(&event.node.key) else { continue };
				let result = match event.action {
					Action::Delete => routes.uninstall(domain),
					Action::Set => {
						let value = event.node.value.unwrap_or_default();
						routes.install(domain, &value).await
					},
				};
				if let Err(e) = result {
					error!(%domain, error = %e, "failed to apply watch event, store and table have diverged");
					std::process::abort();
				}
			}
		}
	}
}

fn last_segment(key: &str) -> Option<&str> {
	let trimmed = key.trim_end_matches('/');
	trimmed.rsplit('/').next().filter(|s| !s.is_empty())
}
