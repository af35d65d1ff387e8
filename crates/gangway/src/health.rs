//! The ingress health endpoint: `GET /healtz` → `200 OK`. Not admission
//! controlled and never routed through the forwarder.

use std::convert::Infallible;

use bytes::Bytes;
use gangway_core::drain::DrainWatcher;
use gangway_core::prelude::*;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

pub struct Server {
	listener: TcpListener,
	drain: DrainWatcher,
}

impl Server {
	pub async fn bind(addr: SocketAddr, drain: DrainWatcher) -> anyhow::Result<Server> {
		let listener = TcpListener::bind(addr)
			.await
			.with_context(|| format!("binding health endpoint on {addr}"))?;
		Ok(Server { listener, drain })
	}

	pub fn address(&self) -> SocketAddr {
		self.listener.local_addr().expect("bound listener has an address")
	}

	pub fn spawn(self) {
		tokio::spawn(self.run());
	}

	async fn run(self) {
		info!(addr = %self.address(), "health endpoint started");
		let wait = self.drain.wait_for_drain();
		tokio::pin!(wait);
		loop {
			tokio::select! {
				res = self.listener.accept() => {
					let Ok((stream, _peer)) = res else { continue };
					tokio::spawn(async move {
						let conn = hyper::server::conn::http1::Builder::new()
							.serve_connection(TokioIo::new(stream), service_fn(handle));
						if let Err(e) = conn.await {
							debug!("health connection error: {e}");
						}
					});
				}
				_ = &mut wait => {
					info!("health endpoint stopped");
					return;
				}
			}
		}
	}
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
	let response = if req.method() == Method::GET && req.uri().path() == "/healtz" {
		Response::new(Full::new(Bytes::from_static(b"OK")))
	} else {
		Response::builder()
			.status(StatusCode::NOT_FOUND)
			.body(Full::new(Bytes::new()))
			.expect("static response")
	};
	Ok(response)
}
