//! Full-duplex byte shuttling between an accepted client and a dialed
//! backend, using pooled scratch buffers.

use std::io;
use std::sync::Arc;

use gangway_core::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::pool::BufferPool;

/// Once one direction finishes, how long the other direction gets to flush
/// whatever the peer still has in flight before both sockets are closed.
const SIBLING_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone, Copy)]
pub struct SpliceResult {
	/// Bytes copied client → backend.
	pub sent: u64,
	/// Bytes copied backend → client.
	pub received: u64,
}

/// Copies bytes in both directions until either side closes, then closes
/// both. EOF is a normal termination; errors from the peer closing underneath
/// us are suppressed.
pub async fn splice(
	client: &mut TcpStream,
	backend: &mut TcpStream,
	send_pool: &Arc<BufferPool>,
	recv_pool: &Arc<BufferPool>,
) -> io::Result<SpliceResult> {
	let (mut cr, mut cw) = client.split();
	let (mut br, mut bw) = backend.split();
	// Both buffers go back to the pool when this function returns, on every path.
	let mut send_buf = send_pool.acquire();
	let mut recv_buf = recv_pool.acquire();
	let mut sent = 0u64;
	let mut received = 0u64;

	let result = {
		let client_to_backend = copy_oneway(&mut cr, &mut bw, &mut send_buf, &mut sent);
		let backend_to_client = copy_oneway(&mut br, &mut cw, &mut recv_buf, &mut received);
		tokio::pin!(client_to_backend, backend_to_client);

		tokio::select! {
			res = &mut client_to_backend => {
				let res = ignore_io_errors(res);
				if res.is_ok() {
					let _ = tokio::time::timeout(SIBLING_GRACE, &mut backend_to_client).await;
				}
				res
			},
			res = &mut backend_to_client => {
				let res = ignore_io_errors(res);
				if res.is_ok() {
					let _ = tokio::time::timeout(SIBLING_GRACE, &mut client_to_backend).await;
				}
				res
			},
		}
	};

	// Close whichever half is still open; the peer may already be gone.
	let _ = cw.shutdown().await;
	let _ = bw.shutdown().await;
	trace!(sent, received, "splice complete");
	result.map(|()| SpliceResult { sent, received })
}

async fn copy_oneway<R, W>(
	reader: &mut R,
	writer: &mut W,
	buf: &mut [u8],
	amt: &mut u64,
) -> io::Result<()>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	loop {
		let n = reader.read(buf).await?;
		if n == 0 {
			// EOF: pass the close along so the peer sees it promptly.
			writer.shutdown().await?;
			return Ok(());
		}
		writer.write_all(&buf[..n]).await?;
		*amt += n as u64;
	}
}

/// A peer may RST or vanish mid-copy; a TCP connection can close at any time
/// and that is not an operator-actionable failure.
fn ignore_io_errors(res: io::Result<()>) -> io::Result<()> {
	use io::ErrorKind::*;
	match &res {
		Err(e) if matches!(e.kind(), NotConnected | UnexpectedEof | ConnectionReset | BrokenPipe) => {
			trace!(err = %e, "connection terminated ungracefully");
			Ok(())
		},
		_ => res,
	}
}
