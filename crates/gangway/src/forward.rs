//! Per-connection driver: admit → (peek) → resolve → dial → splice → close.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use gangway_core::prelude::*;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::dns::{DnsCache, ResolveError};
use crate::pool::BufferPool;
use crate::postgres::{self, HandshakeError};
use crate::routes::{RoutingTable, ServiceKey};
use crate::{copy, dns};

/// Keep-alive probe period for both sides of a spliced connection.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("handshake: {0}")]
	Handshake(#[from] HandshakeError),
	#[error("no backend for user {0}")]
	NoRoute(Strng),
	#[error("backend {0} is no longer known")]
	BackendMissing(ServiceKey),
	#[error(transparent)]
	Resolve(#[from] ResolveError),
	#[error("dialing {0}: {1}")]
	Dial(SocketAddr, io::Error),
	#[error("dialing {0}: timed out")]
	DialTimeout(SocketAddr),
	#[error("copy: {0}")]
	Copy(io::Error),
}

/// How the forwarder picks a backend for an accepted connection.
pub enum BackendSelector {
	/// Ingress: every connection on this listener goes to one fixed service.
	Static(StaticBackend),
	/// Protocol-aware: peek the handshake, look the user up in the live table.
	Dynamic { table: Arc<RoutingTable> },
}

pub struct StaticBackend {
	/// Fully-qualified service DNS name, composed once at startup.
	pub hostname: Strng,
	pub port: u16,
}

pub struct Forwarder {
	pub selector: BackendSelector,
	pub dns: Arc<DnsCache>,
	pub send_pool: Arc<BufferPool>,
	pub recv_pool: Arc<BufferPool>,
	pub connect_timeout: Duration,
	pub cluster_domain: Strng,
}

impl Forwarder {
	/// Drives one admitted connection to completion. All per-connection
	/// failures end here: logged, answered on the wire when the protocol
	/// allows it, and never propagated.
	pub async fn handle(&self, mut client: TcpStream, peer: SocketAddr) {
		let start = Instant::now();
		match self.run(&mut client).await {
			Ok(res) => {
				info!(
					peer = %peer,
					sent = res.sent,
					received = res.received,
					dur = ?start.elapsed(),
					"connection closed"
				);
			},
			Err(e) => {
				if let BackendSelector::Dynamic { .. } = self.selector {
					if let Some(frame) = wire_error(&e) {
						let _ = client.write_all(&frame).await;
					}
				}
				// A client speaking garbage is routine; a backend we cannot
				// reach is not.
				match &e {
					ProxyError::Handshake(_) => debug!(peer = %peer, "connection failed: {e}"),
					_ => warn!(peer = %peer, "connection failed: {e}"),
				}
			},
		}
	}

	async fn run(&self, client: &mut TcpStream) -> Result<copy::SpliceResult, ProxyError> {
		let (hostname, port, replay) = self.select_backend(client).await?;

		let addrs = self.dns.lookup(hostname.clone()).await?;
		// Multiple addresses may come back; we commit to the first.
		let ip = *addrs
			.first()
			.ok_or_else(|| ProxyError::Resolve(dns::ResolveError::NoAddresses(hostname.clone())))?;
		let addr = SocketAddr::new(ip, port);

		let mut backend = self.dial(addr).await?;
		if let Some(replay) = replay {
			// The backend must see the startup packet exactly as the client
			// sent it, before anything else.
			backend.write_all(&replay).await.map_err(ProxyError::Copy)?;
		}
		copy::splice(client, &mut backend, &self.send_pool, &self.recv_pool)
			.await
			.map_err(ProxyError::Copy)
	}

	/// Resolves the backend identity for this connection, consuming the
	/// handshake from the client when the protocol requires it.
	async fn select_backend(
		&self,
		client: &mut TcpStream,
	) -> Result<(Strng, u16, Option<Bytes>), ProxyError> {
		match &self.selector {
			BackendSelector::Static(backend) => Ok((backend.hostname.clone(), backend.port, None)),
			BackendSelector::Dynamic { table } => {
				let startup = postgres::read_startup(client).await?;
				let key = table
					.lookup(&startup.user)
					.ok_or_else(|| ProxyError::NoRoute(startup.user.clone()))?;
				let backend = table
					.lookup_backend(&key)
					.ok_or(ProxyError::BackendMissing(key))?;
				debug!(user = startup.user.as_str(), backend = %backend.key, "route selected");
				Ok((
					backend.fqdn(&self.cluster_domain),
					backend.port,
					Some(startup.replay),
				))
			},
		}
	}

	async fn dial(&self, addr: SocketAddr) -> Result<TcpStream, ProxyError> {
		let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(e)) => return Err(ProxyError::Dial(addr, e)),
			Err(_) => return Err(ProxyError::DialTimeout(addr)),
		};
		tune_socket(&stream).map_err(|e| ProxyError::Dial(addr, e))?;
		Ok(stream)
	}
}

/// Applied symmetrically to accepted and dialed sockets.
pub fn tune_socket(stream: &TcpStream) -> io::Result<()> {
	stream.set_nodelay(true)?;
	let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
	SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
	Ok(())
}

/// The error frame owed to a protocol-aware client, if the failure is one the
/// client should hear about. Malformed or unsupported handshakes get silence.
fn wire_error(e: &ProxyError) -> Option<Bytes> {
	match e {
		ProxyError::Handshake(HandshakeError::NoUser) | ProxyError::NoRoute(_) | ProxyError::BackendMissing(_) => {
			Some(postgres::error_frame(
				postgres::SQLSTATE_INVALID_AUTHORIZATION,
				&e.to_string(),
			))
		},
		ProxyError::Resolve(_) | ProxyError::Dial(_, _) | ProxyError::DialTimeout(_) => Some(
			postgres::error_frame(postgres::SQLSTATE_INTERNAL_ERROR, "upstream unavailable"),
		),
		ProxyError::Handshake(_) | ProxyError::Copy(_) => None,
	}
}
