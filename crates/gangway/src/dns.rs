use std::collections::HashMap;
use std::sync::RwLock;

use gangway_core::drain::DrainWatcher;
use gangway_core::prelude::*;
use hickory_resolver::TokioResolver;
use hickory_resolver::name_server::TokioConnectionProvider;
use tokio::time::Instant;

/// How long a resolved address list stays authoritative. The orchestrator
/// reassigns service addresses far less often than this, so callers tolerate
/// the staleness window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
	#[error("resolving {0}: {1}")]
	Lookup(Strng, String),
	#[error("resolving {0}: no addresses returned")]
	NoAddresses(Strng),
}

/// Hostname → address-list cache in front of the system resolver.
///
/// Entries expire lazily on lookup and eagerly via [`DnsCache::sweep`].
/// Failed resolutions are never cached; the next lookup retries.
pub struct DnsCache {
	resolver: Resolver,
	ttl: Duration,
	entries: RwLock<HashMap<Strng, Entry>>,
}

struct Entry {
	addrs: Arc<Vec<IpAddr>>,
	inserted_at: Instant,
}

enum Resolver {
	System(TokioResolver),
	#[cfg(test)]
	Mock(tests::MockResolver),
}

impl Resolver {
	async fn resolve(&self, host: &Strng) -> Result<Vec<IpAddr>, ResolveError> {
		match self {
			Resolver::System(resolver) => resolver
				.lookup_ip(host.as_str())
				.await
				.map(|lookup| lookup.iter().collect())
				.map_err(|e| ResolveError::Lookup(host.clone(), e.to_string())),
			#[cfg(test)]
			Resolver::Mock(mock) => mock.resolve(host),
		}
	}
}

impl DnsCache {
	pub fn system(ttl: Duration) -> anyhow::Result<Arc<DnsCache>> {
		let (config, opts) = hickory_resolver::system_conf::read_system_conf()?;
		let mut rb =
			hickory_resolver::Resolver::builder_with_config(config, TokioConnectionProvider::default());
		*rb.options_mut() = opts;
		Ok(Arc::new(DnsCache {
			resolver: Resolver::System(rb.build()),
			ttl,
			entries: RwLock::new(HashMap::new()),
		}))
	}

	#[cfg(test)]
	pub(crate) fn mock(ttl: Duration, mock: tests::MockResolver) -> Arc<DnsCache> {
		Arc::new(DnsCache {
			resolver: Resolver::Mock(mock),
			ttl,
			entries: RwLock::new(HashMap::new()),
		})
	}

	/// Returns a non-empty address list for the hostname, from cache when
	/// fresh. A successful resolution with zero addresses is a failure.
	pub async fn lookup(&self, host: Strng) -> Result<Arc<Vec<IpAddr>>, ResolveError> {
		if let Some(addrs) = self.cached(&host) {
			return Ok(addrs);
		}
		let addrs = self.resolver.resolve(&host).await?;
		if addrs.is_empty() {
			return Err(ResolveError::NoAddresses(host));
		}
		let addrs = Arc::new(addrs);
		self.entries.write().unwrap().insert(
			host,
			Entry {
				addrs: addrs.clone(),
				inserted_at: Instant::now(),
			},
		);
		Ok(addrs)
	}

	fn cached(&self, host: &Strng) -> Option<Arc<Vec<IpAddr>>> {
		let entries = self.entries.read().unwrap();
		entries
			.get(host)
			.filter(|e| e.inserted_at.elapsed() < self.ttl)
			.map(|e| e.addrs.clone())
	}

	/// Drops every entry past the TTL. Run from [`DnsCache::sweep`]; exposed
	/// separately so it can be exercised directly.
	pub fn expire(&self) {
		let ttl = self.ttl;
		self
			.entries
			.write()
			.unwrap()
			.retain(|_, e| e.inserted_at.elapsed() < ttl);
	}

	/// Background sweeper; returns when the process starts draining.
	pub async fn sweep(self: Arc<Self>, drain: DrainWatcher) {
		let mut interval = tokio::time::interval(SWEEP_INTERVAL);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		let wait = drain.wait_for_drain();
		tokio::pin!(wait);
		loop {
			tokio::select! {
				_ = interval.tick() => self.expire(),
				_ = &mut wait => {
					debug!("dns sweeper stopped");
					return;
				}
			}
		}
	}

	#[cfg(test)]
	fn cached_len(&self) -> usize {
		self.entries.read().unwrap().len()
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use std::collections::HashMap;
	use std::sync::Mutex;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[derive(Default)]
	pub(crate) struct MockResolver {
		responses: Mutex<HashMap<Strng, Vec<IpAddr>>>,
		calls: Arc<AtomicUsize>,
	}

	impl MockResolver {
		pub(crate) fn new() -> MockResolver {
			Default::default()
		}

		pub(crate) fn insert(&self, host: &str, addrs: Vec<IpAddr>) {
			self
				.responses
				.lock()
				.unwrap()
				.insert(strng::new(host), addrs);
		}

		pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
			self.calls.clone()
		}

		pub(crate) fn resolve(&self, host: &Strng) -> Result<Vec<IpAddr>, ResolveError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			self
				.responses
				.lock()
				.unwrap()
				.get(host)
				.cloned()
				.ok_or_else(|| ResolveError::Lookup(host.clone(), "mock: no such host".to_string()))
		}
	}

	fn addr(s: &str) -> IpAddr {
		s.parse().unwrap()
	}

	#[tokio::test]
	async fn lookup_caches_within_ttl() {
		let mock = MockResolver::new();
		mock.insert("web.apps.svc.cluster.local", vec![addr("10.0.0.1")]);
		let calls = mock.calls();
		let cache = DnsCache::mock(DEFAULT_TTL, mock);

		let first = cache
			.lookup(strng::new("web.apps.svc.cluster.local"))
			.await
			.unwrap();
		let second = cache
			.lookup(strng::new("web.apps.svc.cluster.local"))
			.await
			.unwrap();
		assert_eq!(*first, vec![addr("10.0.0.1")]);
		assert_eq!(first, second);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn lookup_re_resolves_after_ttl() {
		let mock = MockResolver::new();
		mock.insert("db.ns.svc.cluster.local", vec![addr("10.0.0.2")]);
		let calls = mock.calls();
		let cache = DnsCache::mock(Duration::from_secs(60), mock);

		cache
			.lookup(strng::new("db.ns.svc.cluster.local"))
			.await
			.unwrap();
		tokio::time::advance(Duration::from_secs(61)).await;
		cache
			.lookup(strng::new("db.ns.svc.cluster.local"))
			.await
			.unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn empty_results_are_failures_and_not_cached() {
		let mock = MockResolver::new();
		mock.insert("empty.ns.svc.cluster.local", vec![]);
		let calls = mock.calls();
		let cache = DnsCache::mock(DEFAULT_TTL, mock);

		let res = cache.lookup(strng::new("empty.ns.svc.cluster.local")).await;
		assert!(matches!(res, Err(ResolveError::NoAddresses(_))));
		assert_eq!(cache.cached_len(), 0);

		// Retried, not served from cache.
		let _ = cache.lookup(strng::new("empty.ns.svc.cluster.local")).await;
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn errors_are_not_cached() {
		let mock = MockResolver::new();
		let calls = mock.calls();
		let cache = DnsCache::mock(DEFAULT_TTL, mock);

		let res = cache.lookup(strng::new("missing.ns.svc.cluster.local")).await;
		assert!(matches!(res, Err(ResolveError::Lookup(_, _))));
		let _ = cache.lookup(strng::new("missing.ns.svc.cluster.local")).await;
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn expire_drops_stale_entries_only() {
		let mock = MockResolver::new();
		mock.insert("old.ns.svc.cluster.local", vec![addr("10.0.0.3")]);
		mock.insert("new.ns.svc.cluster.local", vec![addr("10.0.0.4")]);
		let cache = DnsCache::mock(Duration::from_secs(60), mock);

		cache
			.lookup(strng::new("old.ns.svc.cluster.local"))
			.await
			.unwrap();
		tokio::time::advance(Duration::from_secs(45)).await;
		cache
			.lookup(strng::new("new.ns.svc.cluster.local"))
			.await
			.unwrap();
		tokio::time::advance(Duration::from_secs(30)).await;

		cache.expire();
		assert_eq!(cache.cached_len(), 1);
	}
}
