//! Pulls encoded frames off `video_queue`, shards + FEC-protects them, and sends
//! each shard as an individual UDP datagram to the discovered peer.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::fec;
use crate::rtp::{self, VIDEO_HEADER_SIZE};
use crate::session::{SessionRuntime, State};

use super::{bind_dual_stack_udp, discover_peer};

const H264_IDR_NALU_HEADER: u8 = 0x65;
const HEVC_IDR_NALU_HEADER: u8 = 0x28;

/// Runs the video streamer to completion on the calling thread. Intended to be
/// spawned as its own OS thread by the session manager.
pub fn run(runtime: Arc<SessionRuntime>, config: Config) {
	while runtime.state.get() == State::Starting {
		std::thread::sleep(Duration::from_millis(1));
	}

	let socket = match bind_dual_stack_udp(config.stream.video.port) {
		Ok(socket) => socket,
		Err(e) => {
			tracing::error!("Failed to bind video socket: {e}");
			runtime.stop();
			return;
		},
	};

	let ping_timeout = Duration::from_secs(config.stream_timeout);
	let peer = match discover_peer(&socket, ping_timeout) {
		Some(peer) => peer,
		None => {
			tracing::debug!("Timed out waiting for video stream PING.");
			runtime.stop();
			return;
		},
	};

	let fec_percentage = config.stream.video.fec_percentage;
	let mut lowseq: u32 = 0;

	loop {
		let Some(frame) = runtime.video_queue.pop() else {
			break;
		};

		send_frame(&socket, peer, &runtime, &frame, fec_percentage, &mut lowseq);
	}

	tracing::debug!("Video stream stopped.");
	runtime.stop();
}

fn send_frame(
	socket: &UdpSocket,
	peer: std::net::SocketAddr,
	runtime: &SessionRuntime,
	frame: &crate::external::EncodedFrame,
	fec_percentage: u8,
	lowseq: &mut u32,
) {
	let mut payload = Vec::with_capacity(rtp::NV_VIDEO_MARKER.len() + frame.data.len());
	payload.extend_from_slice(rtp::NV_VIDEO_MARKER);
	payload.extend_from_slice(&frame.data);

	if frame.is_keyframe() {
		let nalu_header = if runtime.config.monitor.video_format == 0 { H264_IDR_NALU_HEADER } else { HEVC_IDR_NALU_HEADER };
		ensure_4byte_start_code(&mut payload, nalu_header);
	}

	let blocksize = runtime.config.packetsize + rtp::MAX_RTP_HEADER_SIZE;
	let payload_blocksize = blocksize - VIDEO_HEADER_SIZE;
	let data_shards = payload.len().div_ceil(payload_blocksize).max(1);

	let mut buffer = vec![0u8; data_shards * blocksize];
	for i in 0..data_shards {
		let start = i * payload_blocksize;
		let end = ((i + 1) * payload_blocksize).min(payload.len());
		let dest = i * blocksize + VIDEO_HEADER_SIZE;
		buffer[dest..dest + (end - start)].copy_from_slice(&payload[start..end]);

		rtp::write_data_shard_header(&mut buffer[i * blocksize..(i + 1) * blocksize], *lowseq, i, data_shards, frame.pts, fec_percentage);
	}

	let mut shards = match fec::encode(&buffer, blocksize, fec_percentage) {
		Ok(shards) => shards,
		Err(e) => {
			tracing::warn!("Dropping frame {}: {e}", frame.pts);
			return;
		},
	};

	for i in shards.data_shards..shards.total_shards() {
		rtp::patch_parity_shard_header(shards.shard_mut(i), *lowseq, i, shards.data_shards, frame.pts, fec_percentage);
	}

	for i in 0..shards.total_shards() {
		if let Err(e) = socket.send_to(shards.shard(i), peer) {
			tracing::trace!("Failed to send video shard to {peer}: {e}");
		}
	}

	*lowseq += shards.total_shards() as u32;
}

/// Replaces the first occurrence of a 3-byte-start-code IDR NALU with its 4-byte
/// form. A no-op if the 4-byte form is already present, tolerating encoders that
/// already emit it rather than asserting.
fn ensure_4byte_start_code(payload: &mut Vec<u8>, nalu_header: u8) {
	let pattern = [0x00, 0x00, 0x01, nalu_header];
	if let Some(position) = find_subsequence(payload, &pattern) {
		if position == 0 || payload[position - 1] != 0x00 {
			payload.insert(position, 0x00);
		}
	}
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn inserts_leading_zero_for_3byte_start_code() {
		let mut payload = vec![0x11, 0x00, 0x00, 0x01, 0x65, 0x22];
		ensure_4byte_start_code(&mut payload, H264_IDR_NALU_HEADER);
		assert_eq!(payload, vec![0x11, 0x00, 0x00, 0x00, 0x01, 0x65, 0x22]);
	}

	#[test]
	fn is_a_noop_when_4byte_start_code_already_present() {
		let mut payload = vec![0x11, 0x00, 0x00, 0x00, 0x01, 0x65, 0x22];
		let before = payload.clone();
		ensure_4byte_start_code(&mut payload, H264_IDR_NALU_HEADER);
		assert_eq!(payload, before);
	}

	#[test]
	fn is_a_noop_when_pattern_absent() {
		let mut payload = vec![0x11, 0x22, 0x33];
		let before = payload.clone();
		ensure_4byte_start_code(&mut payload, H264_IDR_NALU_HEADER);
		assert_eq!(payload, before);
	}

	#[test]
	fn hevc_pattern_uses_the_hevc_nalu_header() {
		let mut payload = vec![0x00, 0x00, 0x01, 0x28];
		ensure_4byte_start_code(&mut payload, HEVC_IDR_NALU_HEADER);
		assert_eq!(payload, vec![0x00, 0x00, 0x00, 0x01, 0x28]);
	}

	fn test_runtime() -> SessionRuntime {
		use crate::session::{AudioConfig, MonitorConfig, SessionConfig};

		let config = SessionConfig {
			packetsize: 1024,
			audio: AudioConfig { channels: 2, mask: 0x3, packet_duration: 5 },
			monitor: MonitorConfig {
				height: 1080,
				width: 1920,
				framerate: 60,
				bitrate: 10000,
				slices_per_frame: 1,
				num_ref_frames: 0,
				encoder_csc_mode: 0,
				video_format: 0,
				dynamic_range: 0,
			},
		};
		SessionRuntime::new(Arc::new(crate::session::StateAtom::new()), [0u8; 16], [0u8; 16], false, config, Duration::from_secs(10))
	}

	#[test]
	fn every_sent_shard_is_exactly_blocksize() {
		let runtime = test_runtime();
		let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
		let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
		receiver.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
		let peer = receiver.local_addr().unwrap();

		let frame = crate::external::EncodedFrame { data: vec![0x42u8; 5000], pts: 7, flags: 0 };
		let mut lowseq = 0u32;
		send_frame(&sender, peer, &runtime, &frame, 20, &mut lowseq);

		let blocksize = runtime.config.packetsize + rtp::MAX_RTP_HEADER_SIZE;
		let mut received = 0;
		let mut buffer = vec![0u8; blocksize + 64];
		while let Ok((length, _)) = receiver.recv_from(&mut buffer) {
			assert_eq!(length, blocksize);
			received += 1;
		}
		assert!(received > 0);
		assert!(lowseq > 0);
	}

	#[test]
	fn frame_that_would_overflow_fec_is_dropped_without_sending() {
		let runtime = test_runtime();
		let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
		let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
		receiver.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
		let peer = receiver.local_addr().unwrap();

		// With packetsize=1024 this yields a payload_blocksize too small to keep the
		// block under the 255-shard cap once FEC parity is added.
		let huge_frame = crate::external::EncodedFrame { data: vec![0x11u8; 10_000_000], pts: 1, flags: 0 };
		let mut lowseq = 0u32;
		send_frame(&sender, peer, &runtime, &huge_frame, 20, &mut lowseq);

		let mut buffer = [0u8; 16];
		assert!(receiver.recv_from(&mut buffer).is_err());
		assert_eq!(lowseq, 0);
	}
}
