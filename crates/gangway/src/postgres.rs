//! PostgreSQL startup-message handling: just enough of the wire format to
//! learn which user is connecting and to hand the backend a bit-exact copy of
//! the handshake.

use bytes::{BufMut, Bytes, BytesMut};
use gangway_core::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol 3.0 startup code.
pub const STARTUP_CODE: i32 = 196608;
/// Magic code requesting TLS. We always decline.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Upper bound on the startup packet body. Anything larger is not a real
/// client.
const MAX_STARTUP_BODY: usize = 8192;

/// Deadline for the entire handshake exchange, including an SSL round.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLSTATE for every missing-route case.
pub const SQLSTATE_INVALID_AUTHORIZATION: &str = "28000";
/// SQLSTATE for failures the client cannot act on.
pub const SQLSTATE_INTERNAL_ERROR: &str = "XX000";

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("malformed startup packet: {0}")]
	Malformed(&'static str),
	#[error("unsupported protocol code {0}")]
	UnsupportedProtocol(i32),
	#[error("startup packet has no user")]
	NoUser,
	#[error("handshake timed out")]
	Timeout,
}

/// The parsed handshake: the routing key and the verbatim bytes to replay to
/// the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup {
	pub user: Strng,
	pub replay: Bytes,
}

/// Reads the client's startup message, declining at most one SSL request
/// along the way, and extracts the `user` parameter. `replay` is exactly the
/// length header, protocol code and parameter block as read from the wire;
/// reformatting it would break backends that trust the length field.
pub async fn read_startup<S>(io: &mut S) -> Result<Startup, HandshakeError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_startup_inner(io)).await {
		Ok(res) => res,
		Err(_) => Err(HandshakeError::Timeout),
	}
}

async fn read_startup_inner<S>(io: &mut S) -> Result<Startup, HandshakeError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut declined_ssl = false;
	loop {
		let mut head = [0u8; 4];
		io.read_exact(&mut head).await?;
		let len = i32::from_be_bytes(head);
		// The declared length covers itself; the body is what follows.
		let body_len = match len.checked_sub(4) {
			Some(body) if body > 0 && body as usize <= MAX_STARTUP_BODY => body as usize,
			_ => return Err(HandshakeError::Malformed("length out of bounds")),
		};
		if body_len < 4 {
			return Err(HandshakeError::Malformed("truncated protocol code"));
		}
		let mut code_buf = [0u8; 4];
		io.read_exact(&mut code_buf).await?;
		let code = i32::from_be_bytes(code_buf);

		match code {
			SSL_REQUEST_CODE => {
				if body_len != 4 {
					return Err(HandshakeError::Malformed("ssl request with a body"));
				}
				if declined_ssl {
					return Err(HandshakeError::UnsupportedProtocol(code));
				}
				declined_ssl = true;
				// Plaintext only; the client either retries in the clear or goes away.
				io.write_all(b"N").await?;
				io.flush().await?;
			},
			STARTUP_CODE => {
				let params_len = body_len - 4;
				if params_len == 0 {
					return Err(HandshakeError::Malformed("missing parameter block"));
				}
				let mut params = vec![0u8; params_len];
				io.read_exact(&mut params).await?;
				if params.last() != Some(&0) {
					return Err(HandshakeError::Malformed("unterminated parameter block"));
				}
				let user = find_param(&params, "user")?;

				let mut replay = BytesMut::with_capacity(4 + body_len);
				replay.put_slice(&head);
				replay.put_slice(&code_buf);
				replay.put_slice(&params);
				return Ok(Startup {
					user,
					replay: replay.freeze(),
				});
			},
			other => return Err(HandshakeError::UnsupportedProtocol(other)),
		}
	}
}

/// Scans the NUL-delimited `name\0value\0…\0` block for the named parameter.
fn find_param(block: &[u8], name: &str) -> Result<Strng, HandshakeError> {
	// Drop the trailing terminator, then walk name/value pairs.
	let block = &block[..block.len() - 1];
	let mut fields = block.split(|b| *b == 0);
	loop {
		let Some(n) = fields.next() else {
			return Err(HandshakeError::NoUser);
		};
		if n.is_empty() {
			return Err(HandshakeError::NoUser);
		}
		let Some(v) = fields.next() else {
			return Err(HandshakeError::Malformed("parameter without value"));
		};
		if n == name.as_bytes() {
			if v.is_empty() {
				return Err(HandshakeError::NoUser);
			}
			let v =
				std::str::from_utf8(v).map_err(|_| HandshakeError::Malformed("parameter not utf-8"))?;
			return Ok(strng::new(v));
		}
	}
}

/// Builds an ErrorResponse frame: `'E'` + length + severity/code/message
/// fields + terminator. The length field covers the payload plus itself.
pub fn error_frame(sqlstate: &str, message: &str) -> Bytes {
	let mut payload = BytesMut::new();
	payload.put_u8(b'S');
	payload.put_slice(b"ERROR");
	payload.put_u8(0);
	payload.put_u8(b'C');
	payload.put_slice(sqlstate.as_bytes());
	payload.put_u8(0);
	payload.put_u8(b'M');
	payload.put_slice(message.as_bytes());
	payload.put_u8(0);
	payload.put_u8(0);

	let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
	frame.put_u8(b'E');
	frame.put_i32(payload.len() as i32 + 4);
	frame.put_slice(&payload);
	frame.freeze()
}
