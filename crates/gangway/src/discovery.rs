//! Service discovery for the protocol-aware proxy: a list+watch loop over
//! orchestrator Service objects carrying our management labels, feeding the
//! routing table through Add/Delete events.

use std::collections::HashSet;
use std::path::Path;

use futures_util::{StreamExt, TryStreamExt};
use gangway_core::drain::DrainWatcher;
use gangway_core::prelude::*;
use k8s_openapi::api::core::v1::Service;
use kube::Client;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use tokio::sync::watch;

use crate::routes::{BackendService, RoutingTable, ServiceKey};

/// Label naming the protocol class of a managed service. Objects of any other
/// class are ignored wholesale.
const TYPE_LABEL: &str = "type";
/// The protocol class this proxy serves.
const PROTOCOL_CLASS: &str = "postgresql";
/// Labels whose values enumerate the routing keys of a backend.
const USERNAME_LABEL_PREFIX: &str = "username-";
/// The named service port we dial; falls back to the protocol default.
const PORT_NAME: &str = "postgresql";
const DEFAULT_PORT: u16 = 5432;

/// Pause between a failed (or closed) watch and the next full resync.
const RESYNC_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub enum Event {
	Add(BackendService),
	Delete(ServiceKey),
}

/// Applies a discovery event to the routing table. Add covers both new and
/// modified objects; the table replaces atomically.
pub fn apply(table: &RoutingTable, event: Event) {
	match event {
		Event::Add(backend) => {
			debug!(service = %backend.key, port = backend.port, keys = backend.routing_keys.len(), "backend added");
			table.apply_add(backend);
		},
		Event::Delete(key) => {
			debug!(service = %key, "backend removed");
			table.apply_delete(&key);
		},
	}
}

/// Builds the orchestrator client: a kubeconfig when a path is configured,
/// in-cluster credentials otherwise. Failures here are startup failures.
pub async fn kube_client(kube_config_path: Option<&Path>) -> anyhow::Result<Client> {
	let config = match kube_config_path {
		Some(path) => {
			let kubeconfig = kube::config::Kubeconfig::read_from(path)
				.with_context(|| format!("reading kubeconfig {}", path.display()))?;
			kube::Config::from_custom_kubeconfig(kubeconfig, &kube::config::KubeConfigOptions::default())
				.await
				.context("loading kubeconfig")?
		},
		None => kube::Config::incluster().context("in-cluster configuration")?,
	};
	Client::try_from(config).context("building orchestrator client")
}

pub struct Watcher {
	api: Api<Service>,
	selector: String,
	/// Keys we have emitted Adds for; used to retire services that vanished
	/// while the watch was down.
	known: HashSet<ServiceKey>,
}

impl Watcher {
	pub fn new(client: Client, selector: impl Into<String>) -> Watcher {
		Watcher {
			api: Api::all(client),
			selector: selector.into(),
			known: HashSet::new(),
		}
	}

	/// Runs the resync loop until the process drains. `synced` flips to true
	/// once the first snapshot has been delivered; the proxy holds its
	/// listener until then. Discovery failures are retried forever: serving
	/// a stale table beats refusing all traffic.
	pub async fn run<F>(mut self, mut callback: F, synced: watch::Sender<bool>, drain: DrainWatcher)
	where
		F: FnMut(Event),
	{
		let wait = drain.wait_for_drain();
		tokio::pin!(wait);
		loop {
			tokio::select! {
				_ = &mut wait => {
					debug!("discovery watcher stopped");
					return;
				}
				res = Self::sync_once(&self.api, &self.selector, &mut self.known, &mut callback, &synced) => {
					match res {
						Ok(()) => debug!("watch stream ended, resyncing"),
						Err(e) => warn!(err = ?e, "discovery sync failed, retrying"),
					}
				}
			}
			tokio::select! {
				_ = tokio::time::sleep(RESYNC_BACKOFF) => {},
				_ = &mut wait => {
					debug!("discovery watcher stopped");
					return;
				}
			}
		}
	}

	/// One LIST followed by one WATCH from the list's resource version.
	/// Returns when the watch stream closes or errors; the caller re-lists,
	/// which guarantees no event is permanently missed.
	async fn sync_once<F>(
		api: &Api<Service>,
		selector: &str,
		known: &mut HashSet<ServiceKey>,
		callback: &mut F,
		synced: &watch::Sender<bool>,
	) -> anyhow::Result<()>
	where
		F: FnMut(Event),
	{
		let lp = ListParams::default().labels(selector);
		let list = api.list(&lp).await.context("listing services")?;

		let mut fresh = HashSet::new();
		for svc in &list.items {
			if let Some(backend) = parse_service(svc) {
				fresh.insert(backend.key.clone());
				callback(Event::Add(backend));
			}
		}
		// Anything we knew that the snapshot no longer contains went away
		// while we were not watching.
		for key in std::mem::take(known) {
			if !fresh.contains(&key) {
				callback(Event::Delete(key));
			}
		}
		*known = fresh;
		let _ = synced.send(true);

		let version = list.metadata.resource_version.unwrap_or_default();
		let wp = WatchParams::default().labels(selector);
		let mut stream = api
			.watch(&wp, &version)
			.await
			.context("starting watch")?
			.boxed();

		while let Some(event) = stream.try_next().await.context("watch stream")? {
			match event {
				WatchEvent::Added(svc) | WatchEvent::Modified(svc) => {
					if let Some(backend) = parse_service(&svc) {
						known.insert(backend.key.clone());
						callback(Event::Add(backend));
					}
				},
				WatchEvent::Deleted(svc) => {
					if let Some(key) = service_key(&svc) {
						known.remove(&key);
						callback(Event::Delete(key));
					}
				},
				WatchEvent::Bookmark(_) => {},
				WatchEvent::Error(e) => {
					anyhow::bail!("watch error {}: {}", e.code, e.message);
				},
			}
		}
		Ok(())
	}
}

fn service_key(svc: &Service) -> Option<ServiceKey> {
	let name = svc.metadata.name.as_deref()?;
	let namespace = svc.metadata.namespace.as_deref()?;
	Some(ServiceKey::new(namespace, name))
}

/// Converts an orchestrator Service into a routable backend. Objects of the
/// wrong protocol class (or with no class at all) are dropped silently.
fn parse_service(svc: &Service) -> Option<BackendService> {
	let key = service_key(svc)?;
	let labels = svc.metadata.labels.as_ref()?;
	if labels.get(TYPE_LABEL).map(String::as_str) != Some(PROTOCOL_CLASS) {
		return None;
	}
	let routing_keys = labels
		.iter()
		.filter(|(name, value)| name.starts_with(USERNAME_LABEL_PREFIX) && !value.is_empty())
		.map(|(_, value)| strng::new(value))
		.collect();
	let port = svc
		.spec
		.as_ref()
		.and_then(|spec| spec.ports.as_ref())
		.and_then(|ports| {
			ports
				.iter()
				.find(|p| p.name.as_deref() == Some(PORT_NAME))
		})
		.map(|p| p.port as u16)
		.unwrap_or(DEFAULT_PORT);

	Some(BackendService {
		key,
		port,
		routing_keys,
	})
}
