//! Wraps each popped opus frame in an RTP header and sends it to the discovered peer.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::rtp::{self, RTP_HEADER_SIZE};
use crate::session::{SessionRuntime, State};

use super::{bind_dual_stack_udp, discover_peer};

/// Runs the audio streamer to completion on the calling thread.
pub fn run(runtime: Arc<SessionRuntime>, config: Config) {
	while runtime.state.get() == State::Starting {
		std::thread::sleep(Duration::from_millis(1));
	}

	let socket = match bind_dual_stack_udp(config.stream.audio.port) {
		Ok(socket) => socket,
		Err(e) => {
			tracing::error!("Failed to bind audio socket: {e}");
			runtime.stop();
			return;
		},
	};

	let ping_timeout = Duration::from_secs(config.stream_timeout);
	let peer = match discover_peer(&socket, ping_timeout) {
		Some(peer) => peer,
		None => {
			tracing::debug!("Timed out waiting for audio stream PING.");
			runtime.stop();
			return;
		},
	};

	// Frame counter starts at 1, matching the reference client's behavior.
	let mut frame_counter: u16 = 1;

	loop {
		let Some(frame) = runtime.audio_queue.pop() else {
			break;
		};

		let mut datagram = vec![0u8; RTP_HEADER_SIZE + frame.data.len()];
		rtp::write_audio_header(&mut datagram, frame_counter);
		datagram[RTP_HEADER_SIZE..].copy_from_slice(&frame.data);

		if let Err(e) = socket.send_to(&datagram, peer) {
			tracing::trace!("Failed to send audio datagram to {peer}: {e}");
		}

		frame_counter = frame_counter.wrapping_add(1);
	}

	tracing::debug!("Audio stream stopped.");
	runtime.stop();
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::UdpSocket;

	#[test]
	fn frame_counter_starts_at_one() {
		let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
		let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
		receiver.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
		let peer = receiver.local_addr().unwrap();

		let mut datagram = vec![0u8; RTP_HEADER_SIZE + 4];
		rtp::write_audio_header(&mut datagram, 1);
		sender.send_to(&datagram, peer).unwrap();

		let mut buffer = [0u8; 64];
		let (length, _) = receiver.recv_from(&mut buffer).unwrap();
		let sequence_number = u16::from_be_bytes(buffer[2..4].try_into().unwrap());
		assert_eq!(sequence_number, 1);
		assert_eq!(buffer[1], rtp::AUDIO_RTP_PACKET_TYPE);
		assert_eq!(length, RTP_HEADER_SIZE + 4);
	}
}
