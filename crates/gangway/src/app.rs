//! Startup wiring for the two proxy variants. Everything here either binds
//! and spawns successfully or aborts the process; after `run_*` returns, only
//! per-connection failures remain and those never escape their tasks.

use gangway_core::prelude::*;
use gangway_core::{drain, signal};
use tokio::sync::watch;

use crate::admission::Admission;
use crate::config::Config;
use crate::discovery;
use crate::dns::{self, DnsCache};
use crate::forward::{BackendSelector, Forwarder, StaticBackend};
use crate::health;
use crate::listener::Listener;
use crate::pool::BufferPool;
use crate::routes::RoutingTable;

/// A running proxy: the signal source and the drain trigger that tears it
/// down.
pub struct Bound {
	pub shutdown: signal::Shutdown,
	drain_tx: drain::DrainTrigger,
}

impl Bound {
	/// Blocks until a termination signal, then drains in-flight connections
	/// within the configured bound.
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		self
			.drain_tx
			.start_drain_and_wait(drain::DrainMode::Graceful)
			.await;
		info!("graceful shutdown complete");
		Ok(())
	}
}

/// The ingress proxy: one listener per configured port mapping, each
/// forwarding to a fixed internal service, plus the health endpoint.
pub async fn run_ingress(cfg: Arc<Config>) -> anyhow::Result<Bound> {
	anyhow::ensure!(
		!cfg.port_mappings.is_empty(),
		"ingress proxy requires at least one port mapping"
	);
	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();

	let dns = DnsCache::system(dns::DEFAULT_TTL)?;
	tokio::spawn(dns.clone().sweep(drain_rx.clone()));
	let admission = Admission::new(cfg.max_connections);
	let send_pool = BufferPool::new(cfg.read_buffer_size);
	let recv_pool = BufferPool::new(cfg.write_buffer_size);

	// Bind everything up front so port conflicts abort startup.
	let mut listeners = Vec::with_capacity(cfg.port_mappings.len());
	for mapping in &cfg.port_mappings {
		let forwarder = Arc::new(Forwarder {
			selector: BackendSelector::Static(StaticBackend {
				hostname: strng::format!(
					"{}.{}.svc.{}",
					mapping.service_name,
					mapping.service_namespace,
					cfg.cluster_domain
				),
				port: mapping.service_port,
			}),
			dns: dns.clone(),
			send_pool: send_pool.clone(),
			recv_pool: recv_pool.clone(),
			connect_timeout: cfg.connection_timeout,
			cluster_domain: cfg.cluster_domain.clone(),
		});
		let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), mapping.port);
		listeners.push(
			Listener::bind(
				strng::format!("ingress-{}", mapping.port),
				bind,
				false,
				admission.clone(),
				forwarder,
				cfg.drain_timeout,
			)
			.await?,
		);
	}
	for listener in listeners {
		tokio::spawn(listener.serve(drain_rx.clone()));
	}

	let health = health::Server::bind(cfg.health_addr, drain_rx.clone())
		.await
		.context("health endpoint starts")?;
	health.spawn();

	Ok(Bound { shutdown, drain_tx })
}

/// The protocol-aware proxy: one listener fed by the discovery watcher.
/// Accepting starts only once the first discovery snapshot has been applied,
/// so early clients are not refused for want of routes.
pub async fn run_postgres(cfg: Arc<Config>) -> anyhow::Result<Bound> {
	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();

	let table = Arc::new(RoutingTable::new());
	let client = discovery::kube_client(cfg.kube_config_path.as_deref())
		.await
		.context("orchestrator client")?;
	let (synced_tx, mut synced_rx) = watch::channel(false);
	let watcher = discovery::Watcher::new(client, cfg.label_selector.clone());
	{
		let table = table.clone();
		tokio::spawn(watcher.run(
			move |event| discovery::apply(&table, event),
			synced_tx,
			drain_rx.clone(),
		));
	}

	let dns = DnsCache::system(dns::DEFAULT_TTL)?;
	tokio::spawn(dns.clone().sweep(drain_rx.clone()));
	let admission = Admission::new(cfg.max_connections);
	let forwarder = Arc::new(Forwarder {
		selector: BackendSelector::Dynamic { table },
		dns: dns.clone(),
		send_pool: BufferPool::new(cfg.read_buffer_size),
		recv_pool: BufferPool::new(cfg.write_buffer_size),
		connect_timeout: cfg.connection_timeout,
		cluster_domain: cfg.cluster_domain.clone(),
	});

	let listener = Listener::bind(
		strng::literal!("postgres"),
		cfg.listen_addr,
		cfg.use_proxy_proto,
		admission,
		forwarder,
		cfg.drain_timeout,
	)
	.await?;

	let drain_for_listener = drain_rx.clone();
	tokio::spawn(async move {
		info!("waiting for the initial discovery snapshot");
		// The sender drops if the watcher exits first (drain before sync);
		// nothing to serve in that case.
		if synced_rx.wait_for(|synced| *synced).await.is_err() {
			return;
		}
		listener.serve(drain_for_listener).await;
	});

	Ok(Bound { shutdown, drain_tx })
}
