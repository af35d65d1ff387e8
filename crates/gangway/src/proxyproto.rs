//! PROXY protocol v2 header parsing for deployments where an external load
//! balancer fronts the proxy. Reads are exact-length so no client payload
//! bytes are consumed along with the header.

use std::net::SocketAddr;

use ppp::v2;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Fixed prefix: 12-byte signature, version/command, family, 16-bit length.
const FIXED_PREFIX: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum ProxyProtoError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("parse error: {0}")]
	Parse(v2::ParseError),
}

/// Reads exactly one PROXY v2 header from the stream and returns the original
/// client address, when the header carries one (LOCAL commands and unix
/// sockets do not).
pub async fn read_header<IO>(io: &mut IO) -> Result<Option<SocketAddr>, ProxyProtoError>
where
	IO: AsyncRead + Unpin,
{
	let mut buf = vec![0u8; FIXED_PREFIX];
	io.read_exact(&mut buf).await?;
	let extra = u16::from_be_bytes([buf[FIXED_PREFIX - 2], buf[FIXED_PREFIX - 1]]) as usize;
	buf.resize(FIXED_PREFIX + extra, 0);
	io.read_exact(&mut buf[FIXED_PREFIX..]).await?;

	let header = v2::Header::try_from(buf.as_slice()).map_err(ProxyProtoError::Parse)?;
	let addr = match header.addresses {
		v2::Addresses::IPv4(a) => Some(SocketAddr::from((a.source_address, a.source_port))),
		v2::Addresses::IPv6(a) => Some(SocketAddr::from((a.source_address, a.source_port))),
		_ => None,
	};
	Ok(addr)
}
