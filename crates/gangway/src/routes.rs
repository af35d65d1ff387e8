use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use gangway_core::prelude::*;

/// Stable identity of a discovered backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
	pub namespace: Strng,
	pub name: Strng,
}

impl ServiceKey {
	pub fn new(namespace: impl AsRef<str>, name: impl AsRef<str>) -> ServiceKey {
		ServiceKey {
			namespace: strng::new(namespace),
			name: strng::new(name),
		}
	}
}

impl Display for ServiceKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}", self.namespace, self.name)
	}
}

/// A routable workload, built from an orchestrator service object.
/// Never mutated in place: discovery replaces the whole value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendService {
	pub key: ServiceKey,
	pub port: u16,
	pub routing_keys: HashSet<Strng>,
}

impl BackendService {
	/// The in-cluster DNS name the forwarder dials.
	pub fn fqdn(&self, cluster_domain: &str) -> Strng {
		strng::format!(
			"{}.{}.svc.{}",
			self.key.name,
			self.key.namespace,
			cluster_domain
		)
	}
}

/// Routing key → backend mapping, rebuilt incrementally from discovery events.
///
/// One writer (the discovery callback), many readers (every connection).
/// Each event is applied in a single critical section, so readers never see a
/// routing key pointing at a backend that is not in the table.
#[derive(Default)]
pub struct RoutingTable {
	inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
	backends: HashMap<ServiceKey, Arc<BackendService>>,
	by_user: HashMap<Strng, ServiceKey>,
}

impl RoutingTable {
	pub fn new() -> RoutingTable {
		Default::default()
	}

	/// Inserts or replaces a backend and rebinds its routing keys. A key
	/// previously bound to a different backend is rebound; last write wins.
	pub fn apply_add(&self, backend: BackendService) {
		let key = backend.key.clone();
		let backend = Arc::new(backend);
		let mut inner = self.inner.write().unwrap();
		inner.backends.insert(key.clone(), backend.clone());
		// A replacement may carry fewer keys than its predecessor.
		inner
			.by_user
			.retain(|user, owner| *owner != key || backend.routing_keys.contains(user));
		for user in &backend.routing_keys {
			if let Some(prev) = inner.by_user.insert(user.clone(), key.clone()) {
				if prev != key {
					warn!(user = user.as_str(), old = %prev, new = %key, "routing key rebound");
				}
			}
		}
	}

	/// Removes a backend and every routing key pointing to it.
	pub fn apply_delete(&self, key: &ServiceKey) {
		let mut inner = self.inner.write().unwrap();
		if inner.backends.remove(key).is_some() {
			inner.by_user.retain(|_, owner| owner != key);
		}
	}

	pub fn lookup(&self, routing_key: &str) -> Option<ServiceKey> {
		self.inner.read().unwrap().by_user.get(routing_key).cloned()
	}

	pub fn lookup_backend(&self, key: &ServiceKey) -> Option<Arc<BackendService>> {
		self.inner.read().unwrap().backends.get(key).cloned()
	}

	pub fn is_empty(&self) -> bool {
		let inner = self.inner.read().unwrap();
		inner.backends.is_empty() && inner.by_user.is_empty()
	}

	pub fn len(&self) -> usize {
		self.inner.read().unwrap().backends.len()
	}
}
