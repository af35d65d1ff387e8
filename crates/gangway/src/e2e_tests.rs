//! End-to-end scenarios over real loopback sockets: a listener, a forwarder,
//! a fake backend, and a scripted client.

use std::sync::Arc;

use gangway_core::drain::{self, DrainMode, DrainWatcher};
use gangway_core::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::admission::Admission;
use crate::dns::tests::MockResolver;
use crate::dns::{self, DnsCache};
use crate::forward::{BackendSelector, Forwarder, StaticBackend};
use crate::listener::Listener;
use crate::pool::BufferPool;
use crate::postgres::{SSL_REQUEST_CODE, STARTUP_CODE};
use crate::routes::{BackendService, RoutingTable, ServiceKey};

fn startup_packet(user: &str) -> Vec<u8> {
	let mut body = Vec::new();
	for (name, value) in [("user", user), ("database", "app")] {
		body.extend_from_slice(name.as_bytes());
		body.push(0);
		body.extend_from_slice(value.as_bytes());
		body.push(0);
	}
	body.push(0);
	let mut packet = Vec::new();
	packet.extend_from_slice(&(body.len() as i32 + 8).to_be_bytes());
	packet.extend_from_slice(&STARTUP_CODE.to_be_bytes());
	packet.extend_from_slice(&body);
	packet
}

fn ssl_request() -> Vec<u8> {
	let mut packet = Vec::new();
	packet.extend_from_slice(&8i32.to_be_bytes());
	packet.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
	packet
}

fn test_dns(hosts: &[&str]) -> Arc<DnsCache> {
	let mock = MockResolver::new();
	for host in hosts {
		mock.insert(host, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
	}
	DnsCache::mock(dns::DEFAULT_TTL, mock)
}

/// A backend that checks the replayed handshake, sends a banner, then echoes.
async fn fake_pg_backend(expected_startup: Vec<u8>, banner: &'static [u8]) -> (u16, JoinHandle<()>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	let handle = tokio::spawn(async move {
		let (mut stream, _) = listener.accept().await.unwrap();
		let mut startup = vec![0u8; expected_startup.len()];
		stream.read_exact(&mut startup).await.unwrap();
		assert_eq!(startup, expected_startup, "replayed handshake must be bit-exact");
		stream.write_all(banner).await.unwrap();
		echo(stream).await;
	});
	(port, handle)
}

/// A backend that echoes everything, for the static (ingress) variant.
async fn echo_backend() -> (u16, JoinHandle<()>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	let handle = tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			tokio::spawn(echo(stream));
		}
	});
	(port, handle)
}

async fn echo(mut stream: TcpStream) {
	let mut buf = [0u8; 256];
	loop {
		match stream.read(&mut buf).await {
			Ok(0) | Err(_) => return,
			Ok(n) => {
				if stream.write_all(&buf[..n]).await.is_err() {
					return;
				}
			},
		}
	}
}

async fn spawn_proxy(
	selector: BackendSelector,
	dns: Arc<DnsCache>,
	max_connections: usize,
	drain_timeout: Duration,
	drain: DrainWatcher,
) -> (SocketAddr, Admission) {
	let admission = Admission::new(max_connections);
	let forwarder = Arc::new(Forwarder {
		selector,
		dns,
		send_pool: BufferPool::new(2048),
		recv_pool: BufferPool::new(2048),
		connect_timeout: Duration::from_secs(1),
		cluster_domain: strng::literal!("cluster.local"),
	});
	let listener = Listener::bind(
		strng::literal!("test"),
		"127.0.0.1:0".parse().unwrap(),
		false,
		admission.clone(),
		forwarder,
		drain_timeout,
	)
	.await
	.unwrap();
	let addr = listener.address();
	tokio::spawn(listener.serve(drain));
	(addr, admission)
}

fn pg_backend_service(port: u16, users: &[&str]) -> BackendService {
	BackendService {
		key: ServiceKey::new("ns", "db1"),
		port,
		routing_keys: users.iter().map(strng::new).collect(),
	}
}

#[tokio::test]
async fn routes_startup_to_labelled_backend() {
	let packet = startup_packet("alice");
	let (port, backend) = fake_pg_backend(packet.clone(), b"ready").await;
	let table = Arc::new(RoutingTable::new());
	table.apply_add(pg_backend_service(port, &["alice"]));

	let (_trigger, drain_rx) = drain::new();
	let (proxy, _) = spawn_proxy(
		BackendSelector::Dynamic { table },
		test_dns(&["db1.ns.svc.cluster.local"]),
		8,
		Duration::from_secs(1),
		drain_rx,
	)
	.await;

	let mut client = TcpStream::connect(proxy).await.unwrap();
	client.write_all(&packet).await.unwrap();
	let mut banner = [0u8; 5];
	client.read_exact(&mut banner).await.unwrap();
	assert_eq!(&banner, b"ready");

	// Full duplex after the handshake.
	client.write_all(b"select 1").await.unwrap();
	let mut echoed = [0u8; 8];
	client.read_exact(&mut echoed).await.unwrap();
	assert_eq!(&echoed, b"select 1");

	// Closing the client closes the backend side too.
	drop(client);
	tokio::time::timeout(Duration::from_secs(2), backend)
		.await
		.expect("backend saw the close")
		.unwrap();
}

#[tokio::test]
async fn declines_ssl_then_proxies() {
	let packet = startup_packet("alice");
	let (port, backend) = fake_pg_backend(packet.clone(), b"ok").await;
	let table = Arc::new(RoutingTable::new());
	table.apply_add(pg_backend_service(port, &["alice"]));

	let (_trigger, drain_rx) = drain::new();
	let (proxy, _) = spawn_proxy(
		BackendSelector::Dynamic { table },
		test_dns(&["db1.ns.svc.cluster.local"]),
		8,
		Duration::from_secs(1),
		drain_rx,
	)
	.await;

	let mut client = TcpStream::connect(proxy).await.unwrap();
	client.write_all(&ssl_request()).await.unwrap();
	let mut decline = [0u8; 1];
	client.read_exact(&mut decline).await.unwrap();
	assert_eq!(&decline, b"N");

	client.write_all(&packet).await.unwrap();
	let mut banner = [0u8; 2];
	client.read_exact(&mut banner).await.unwrap();
	assert_eq!(&banner, b"ok");

	drop(client);
	tokio::time::timeout(Duration::from_secs(2), backend)
		.await
		.expect("backend saw the close")
		.unwrap();
}

#[tokio::test]
async fn unknown_user_gets_an_error_frame_and_close() {
	let table = Arc::new(RoutingTable::new());
	table.apply_add(pg_backend_service(19999, &["alice"]));

	let (_trigger, drain_rx) = drain::new();
	let (proxy, _) = spawn_proxy(
		BackendSelector::Dynamic { table },
		test_dns(&["db1.ns.svc.cluster.local"]),
		8,
		Duration::from_secs(1),
		drain_rx,
	)
	.await;

	let mut client = TcpStream::connect(proxy).await.unwrap();
	client.write_all(&startup_packet("bob")).await.unwrap();

	let mut frame = Vec::new();
	client.read_to_end(&mut frame).await.unwrap();
	assert_eq!(frame[0], b'E');
	let len = i32::from_be_bytes(frame[1..5].try_into().unwrap());
	assert_eq!(len as usize, frame.len() - 1);
	assert!(frame.windows(5).any(|w| w == b"28000"));
}

#[tokio::test]
async fn replaced_backend_serves_new_connections_only() {
	let packet = startup_packet("alice");
	let (port_a, _backend_a) = fake_pg_backend(packet.clone(), b"one").await;
	let (port_b, _backend_b) = fake_pg_backend(packet.clone(), b"two").await;
	let table = Arc::new(RoutingTable::new());
	table.apply_add(pg_backend_service(port_a, &["alice"]));

	let (_trigger, drain_rx) = drain::new();
	let (proxy, _) = spawn_proxy(
		BackendSelector::Dynamic {
			table: table.clone(),
		},
		test_dns(&["db1.ns.svc.cluster.local"]),
		8,
		Duration::from_secs(1),
		drain_rx,
	)
	.await;

	let mut first = TcpStream::connect(proxy).await.unwrap();
	first.write_all(&packet).await.unwrap();
	let mut banner = [0u8; 3];
	first.read_exact(&mut banner).await.unwrap();
	assert_eq!(&banner, b"one");

	// The backend is replaced mid-flight.
	table.apply_add(pg_backend_service(port_b, &["alice"]));

	// The established splice stays where it was.
	first.write_all(b"still here").await.unwrap();
	let mut echoed = [0u8; 10];
	first.read_exact(&mut echoed).await.unwrap();
	assert_eq!(&echoed, b"still here");

	// A fresh connection lands on the replacement.
	let mut second = TcpStream::connect(proxy).await.unwrap();
	second.write_all(&packet).await.unwrap();
	let mut banner = [0u8; 3];
	second.read_exact(&mut banner).await.unwrap();
	assert_eq!(&banner, b"two");
}

#[tokio::test]
async fn admission_cap_turns_away_excess_connections() {
	let (port, _backend) = echo_backend().await;
	let (_trigger, drain_rx) = drain::new();
	let (proxy, admission) = spawn_proxy(
		BackendSelector::Static(StaticBackend {
			hostname: strng::literal!("web.apps.svc.cluster.local"),
			port,
		}),
		test_dns(&["web.apps.svc.cluster.local"]),
		2,
		Duration::from_secs(1),
		drain_rx,
	)
	.await;

	// Two connections splice and stay idle.
	let mut first = TcpStream::connect(proxy).await.unwrap();
	first.write_all(b"a").await.unwrap();
	assert_eq!(first.read_u8().await.unwrap(), b'a');
	let mut second = TcpStream::connect(proxy).await.unwrap();
	second.write_all(b"b").await.unwrap();
	assert_eq!(second.read_u8().await.unwrap(), b'b');
	assert_eq!(admission.available(), 0);

	// The third is closed immediately with nothing read from it.
	let mut third = TcpStream::connect(proxy).await.unwrap();
	let mut buf = [0u8; 1];
	let res = tokio::time::timeout(Duration::from_secs(2), third.read(&mut buf))
		.await
		.expect("rejection should be prompt");
	assert!(matches!(res, Ok(0) | Err(_)));

	// The first two are unaffected.
	first.write_all(b"c").await.unwrap();
	assert_eq!(first.read_u8().await.unwrap(), b'c');
}

#[tokio::test]
async fn drain_closes_idle_connections_within_the_bound() {
	let (port, _backend) = echo_backend().await;
	let (trigger, drain_rx) = drain::new();
	let (proxy, admission) = spawn_proxy(
		BackendSelector::Static(StaticBackend {
			hostname: strng::literal!("web.apps.svc.cluster.local"),
			port,
		}),
		test_dns(&["web.apps.svc.cluster.local"]),
		4,
		Duration::from_millis(300),
		drain_rx,
	)
	.await;

	// One long-lived idle connection.
	let mut idle = TcpStream::connect(proxy).await.unwrap();
	idle.write_all(b"x").await.unwrap();
	assert_eq!(idle.read_u8().await.unwrap(), b'x');

	// The drain must complete despite the idle connection, within the bound.
	tokio::time::timeout(
		Duration::from_secs(3),
		trigger.start_drain_and_wait(DrainMode::Graceful),
	)
	.await
	.expect("drain must finish");

	// The idle connection was cut.
	let res = tokio::time::timeout(Duration::from_secs(1), idle.read(&mut [0u8; 1]))
		.await
		.expect("closed connection reads promptly");
	assert!(matches!(res, Ok(0) | Err(_)));

	// New connections are refused: the listening socket is gone.
	match TcpStream::connect(proxy).await {
		Err(_) => {},
		Ok(mut stream) => {
			let res = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut [0u8; 1]))
				.await
				.expect("stale accept closes promptly");
			assert!(matches!(res, Ok(0) | Err(_)));
		},
	}

	// No admission permit leaked.
	for _ in 0..50 {
		if admission.available() == admission.max() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	assert_eq!(admission.available(), admission.max());
}
