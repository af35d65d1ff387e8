//! Listening sockets and the accept loop. Each listener runs under the drain
//! machinery: accepting stops the moment a drain starts, in-flight
//! connections get a bounded grace period, then everything left is cut.

use std::sync::Arc;

use gangway_core::drain::{self, DrainUpgrader, DrainWatcher, DrainWeak};
use gangway_core::prelude::*;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::admission::Admission;
use crate::forward::{self, Forwarder};
use crate::proxyproto;

pub struct Listener {
	name: Strng,
	inner: TcpListener,
	use_proxy_proto: bool,
	admission: Admission,
	forwarder: Arc<Forwarder>,
	drain_timeout: Duration,
}

impl Listener {
	/// Binds the socket at startup so address conflicts abort the process
	/// instead of surfacing later.
	pub async fn bind(
		name: Strng,
		addr: SocketAddr,
		use_proxy_proto: bool,
		admission: Admission,
		forwarder: Arc<Forwarder>,
		drain_timeout: Duration,
	) -> anyhow::Result<Listener> {
		let inner = TcpListener::bind(addr)
			.await
			.with_context(|| format!("binding {name} on {addr}"))?;
		Ok(Listener {
			name,
			inner,
			use_proxy_proto,
			admission,
			forwarder,
			drain_timeout,
		})
	}

	pub fn address(&self) -> SocketAddr {
		self.inner.local_addr().expect("bound listener has an address")
	}

	/// Accepts and dispatches until drained.
	pub async fn serve(self, drain: DrainWatcher) {
		let Listener {
			name,
			inner,
			use_proxy_proto,
			admission,
			forwarder,
			drain_timeout,
		} = self;
		info!(listener = name.as_str(), addr = %inner.local_addr().expect("bound"), "listener started");
		let component = format!("listener {name}");

		let accept = async move |drain: DrainWatcher, force_shutdown: watch::Receiver<()>| {
			let drain_watch = drain.clone();
			// The accept loop must never block the drain itself, but every
			// accepted connection must. Weak for the loop, upgraded per
			// connection.
			let (mut upgrader, weak) = drain.into_weak();
			let wait = drain_watch.wait_for_drain();
			tokio::pin!(wait);
			loop {
				tokio::select! {
					res = inner.accept() => match res {
						Ok((stream, peer)) => {
							handle_stream(
								&name,
								stream,
								peer,
								use_proxy_proto,
								&admission,
								&forwarder,
								&upgrader,
								&weak,
								&force_shutdown,
							);
						},
						Err(e) => {
							warn!(listener = name.as_str(), "accept failed: {e}");
						},
					},
					_ = &mut wait => break,
				}
			}
			upgrader.disable();
			// Close the listening socket right away; in-flight connections get
			// the bounded grace, new ones get connection refused.
			drop(inner);
			info!(listener = name.as_str(), "listener stopped accepting");
			// Park until the drain either completes or times out; returning
			// earlier would cut the grace period short.
			let mut force_shutdown = force_shutdown;
			let _ = force_shutdown.changed().await;
		};

		drain::run_with_drain(component, drain, drain_timeout, accept).await;
	}
}

#[allow(clippy::too_many_arguments)]
fn handle_stream(
	name: &Strng,
	stream: TcpStream,
	peer: SocketAddr,
	use_proxy_proto: bool,
	admission: &Admission,
	forwarder: &Arc<Forwarder>,
	upgrader: &DrainUpgrader,
	weak: &DrainWeak,
	force_shutdown: &watch::Receiver<()>,
) {
	// Admission first: a rejected connection costs nothing but the accept.
	let Some(permit) = admission.try_admit() else {
		warn!(listener = name.as_str(), peer = %peer, "connection rejected: admission limit reached");
		return;
	};
	if let Err(e) = forward::tune_socket(&stream) {
		debug!(peer = %peer, "socket tuning failed: {e}");
	}

	let blocker = upgrader.upgrade(weak.clone());
	let forwarder = forwarder.clone();
	let name = name.clone();
	let mut force_shutdown = force_shutdown.clone();
	tokio::spawn(async move {
		// Held for the connection's whole life: the blocker holds the drain
		// open, the permit replenishes admission. Declaration order matters:
		// the permit must release no later than the drain observes the
		// blocker drop.
		let _blocker = blocker;
		let _permit = permit;
		let mut stream = stream;
		let mut peer = peer;

		if use_proxy_proto {
			match proxyproto::read_header(&mut stream).await {
				Ok(Some(original)) => peer = original,
				Ok(None) => {},
				Err(e) => {
					debug!(listener = name.as_str(), peer = %peer, "bad PROXY header: {e}");
					return;
				},
			}
		}

		tokio::select! {
			_ = forwarder.handle(stream, peer) => {},
			_ = force_shutdown.changed() => {
				info!(listener = name.as_str(), peer = %peer, "connection forcefully terminated");
			},
		}
	});
}
