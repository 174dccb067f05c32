//! The three stream workers: video, audio, and control.

pub mod audio;
pub mod control;
pub mod video;

use std::net::SocketAddr;
use std::time::Duration;

use socket2::Socket;

/// Binds a dual-stack (IPv6, `IPV6_V6ONLY` cleared) UDP socket on `port`.
///
/// The `Socket::new` -> configure -> `bind` -> hand-to-blocking-loop shape follows
/// `other_examples/…shred-ingest-src-receiver.rs` and `other_examples/…bass-aes67…
/// output-stream.rs`; std's `UdpSocket` has no way to clear `IPV6_V6ONLY` before
/// bind, which is why `socket2` is reached for here. Those two files only build
/// IPv4 sockets, so they ground the general socket2-then-blocking-loop shape, not
/// the dual-stack bind itself.
pub fn bind_dual_stack_udp(port: u16) -> std::io::Result<std::net::UdpSocket> {
	let socket = Socket::new(socket2::Domain::IPV6, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
	socket.set_only_v6(false).ok();
	let address: SocketAddr = format!("[::]:{port}").parse().expect("valid socket address");
	socket.bind(&address.into())?;
	Ok(socket.into())
}

/// Blocks on `socket` until a datagram containing literal ASCII `"PING"` arrives, or
/// `timeout` elapses with nothing recognized. Returns the discovered peer address.
pub fn discover_peer(socket: &std::net::UdpSocket, timeout: Duration) -> Option<SocketAddr> {
	socket.set_read_timeout(Some(timeout)).ok();

	let deadline = std::time::Instant::now() + timeout;
	let mut buffer = [0u8; 1024];

	while std::time::Instant::now() < deadline {
		match socket.recv_from(&mut buffer) {
			Ok((length, address)) if &buffer[..length] == b"PING" => {
				tracing::trace!("Discovered peer {address} via PING.");
				return Some(address);
			},
			Ok((length, address)) => {
				tracing::warn!("Received unexpected {length}-byte message from {address} while waiting for PING.");
			},
			Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => break,
			Err(e) => {
				tracing::warn!("Failed to receive on stream socket: {e}");
				break;
			},
		}
	}

	None
}
