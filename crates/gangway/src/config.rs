use std::collections::HashSet;
use std::path::PathBuf;

use gangway_core::prelude::*;
use serde::Deserialize;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5432";
const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8081";
const DEFAULT_LABEL_SELECTOR: &str = "managedBy=gangway";
const DEFAULT_MAX_CONNECTIONS: usize = 1024;
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The config file as written by the operator. Unknown keys are rejected;
/// absent keys fall back to the documented defaults during validation.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
	pub listen_addr: Option<String>,
	#[serde(default)]
	pub port_mappings: Vec<RawPortMapping>,
	pub label_selector: Option<String>,
	pub max_connections: Option<usize>,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	pub connection_timeout: Option<Duration>,
	pub read_buffer_size: Option<usize>,
	pub write_buffer_size: Option<usize>,
	pub kube_config_path: Option<PathBuf>,
	pub use_proxy_proto: Option<bool>,
	pub cluster_domain: Option<String>,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	pub drain_timeout: Option<Duration>,
	pub health_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPortMapping {
	pub port: u16,
	pub service_name: String,
	pub service_namespace: String,
	pub service_port: u16,
}

/// One ingress listen port and the fixed internal service behind it.
/// Loaded once at startup; immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct PortMapping {
	pub port: u16,
	pub service_name: Strng,
	pub service_namespace: Strng,
	pub service_port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub listen_addr: SocketAddr,
	pub port_mappings: Vec<PortMapping>,
	pub label_selector: String,
	pub max_connections: usize,
	pub connection_timeout: Duration,
	pub read_buffer_size: usize,
	pub write_buffer_size: usize,
	pub kube_config_path: Option<PathBuf>,
	pub use_proxy_proto: bool,
	pub cluster_domain: Strng,
	pub drain_timeout: Duration,
	pub health_addr: SocketAddr,
}

pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let raw: RawConfig = serde_json::from_str(contents).context("invalid config")?;
	validate(raw)
}

fn validate(raw: RawConfig) -> anyhow::Result<Config> {
	let listen_addr = raw
		.listen_addr
		.as_deref()
		.unwrap_or(DEFAULT_LISTEN_ADDR)
		.parse::<SocketAddr>()
		.context("invalid listen_addr")?;
	let health_addr = raw
		.health_addr
		.as_deref()
		.unwrap_or(DEFAULT_HEALTH_ADDR)
		.parse::<SocketAddr>()
		.context("invalid health_addr")?;

	let max_connections = raw.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
	anyhow::ensure!(max_connections > 0, "max_connections must be positive");

	let read_buffer_size = raw.read_buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
	let write_buffer_size = raw.write_buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
	anyhow::ensure!(
		read_buffer_size > 0 && write_buffer_size > 0,
		"buffer sizes must be positive"
	);

	let mut seen_ports = HashSet::new();
	let port_mappings = raw
		.port_mappings
		.into_iter()
		.map(|m| {
			anyhow::ensure!(
				seen_ports.insert(m.port),
				"duplicate listen port {} in port_mappings",
				m.port
			);
			anyhow::ensure!(
				!m.service_name.is_empty() && !m.service_namespace.is_empty(),
				"port mapping {} has an empty service reference",
				m.port
			);
			Ok(PortMapping {
				port: m.port,
				service_name: strng::new(&m.service_name),
				service_namespace: strng::new(&m.service_namespace),
				service_port: m.service_port,
			})
		})
		.collect::<anyhow::Result<Vec<_>>>()?;

	// An empty path means the same as no path: in-cluster credentials.
	let kube_config_path = raw
		.kube_config_path
		.filter(|p| !p.as_os_str().is_empty());

	Ok(Config {
		listen_addr,
		port_mappings,
		label_selector: raw
			.label_selector
			.unwrap_or_else(|| DEFAULT_LABEL_SELECTOR.to_string()),
		max_connections,
		connection_timeout: raw.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
		read_buffer_size,
		write_buffer_size,
		kube_config_path,
		use_proxy_proto: raw.use_proxy_proto.unwrap_or(false),
		cluster_domain: strng::new(
			raw
				.cluster_domain
				.as_deref()
				.unwrap_or(DEFAULT_CLUSTER_DOMAIN),
		),
		drain_timeout: raw.drain_timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT),
		health_addr,
	})
}
