//! The reliable control channel: ping tracking, IDR requests, input decryption,
//! and process-liveness-driven termination.
//!
//! Drives `rusty_enet::Host` directly: bind a `std::net::UdpSocket`, wrap it in a
//! `Host`, and `service()` it in a loop, dispatching each received packet by its
//! 2-byte type code and decrypting `INPUT_DATA` payloads with `aes-gcm`.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use rusty_enet as enet;

use crate::config::Config;
use crate::crypto;
use crate::external::{IdrRequest, InputInjector, ProcessProbe};
use crate::session::{SessionRuntime, State};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessageType {
	StartA,
	StartB,
	InvalidateReferenceFrames,
	LossStats,
	InputData,
	RumbleData,
	Termination,
	Unknown(u16),
}

impl From<u16> for ControlMessageType {
	fn from(code: u16) -> Self {
		match code {
			0x0305 => Self::StartA,
			0x0307 => Self::StartB,
			0x0301 => Self::InvalidateReferenceFrames,
			0x0201 => Self::LossStats,
			0x0206 => Self::InputData,
			0x010b => Self::RumbleData,
			0x0100 => Self::Termination,
			other => Self::Unknown(other),
		}
	}
}

#[derive(Debug)]
pub enum ControlMessage<'a> {
	StartA,
	StartB,
	InvalidateReferenceFrames(IdrRequest),
	LossStats,
	InputData(&'a [u8]),
	RumbleData,
	Termination,
	Unknown(u16),
}

/// Parses the 2-byte little-endian type code + payload framing common to every
/// control packet. Returns `None` for packets too short to carry a type code, or
/// whose fixed-size payload (where one is required) is truncated.
pub fn parse(buffer: &[u8]) -> Option<ControlMessage<'_>> {
	if buffer.len() < 2 {
		return None;
	}

	let type_code = u16::from_le_bytes([buffer[0], buffer[1]]);
	let payload = &buffer[2..];

	Some(match ControlMessageType::from(type_code) {
		ControlMessageType::StartA => ControlMessage::StartA,
		ControlMessageType::StartB => ControlMessage::StartB,
		ControlMessageType::InvalidateReferenceFrames => {
			if payload.len() < 16 {
				return None;
			}
			let first_frame = i64::from_le_bytes(payload[0..8].try_into().unwrap());
			let last_frame = i64::from_le_bytes(payload[8..16].try_into().unwrap());
			ControlMessage::InvalidateReferenceFrames(IdrRequest { first_frame, last_frame })
		},
		ControlMessageType::LossStats => ControlMessage::LossStats,
		ControlMessageType::InputData => ControlMessage::InputData(payload),
		ControlMessageType::RumbleData => ControlMessage::RumbleData,
		ControlMessageType::Termination => ControlMessage::Termination,
		ControlMessageType::Unknown(code) => ControlMessage::Unknown(code),
	})
}

/// Result of successfully decrypting an INPUT_DATA payload.
pub struct DecryptedInput {
	pub plaintext: Vec<u8>,
	pub rolled_iv: Option<[u8; 16]>,
}

/// Decrypts an INPUT_DATA payload: `big-endian i32 cipher_length` followed by
/// `cipher_length` bytes of GCM ciphertext||16-byte tag.
pub fn decrypt_input_data(payload: &[u8], gcm_key: &[u8; 16], iv: &[u8; 16]) -> Result<DecryptedInput, ()> {
	if payload.len() < 4 {
		return Err(());
	}

	let cipher_length = i32::from_be_bytes(payload[0..4].try_into().unwrap());
	if cipher_length < 0 {
		return Err(());
	}
	let cipher_length = cipher_length as usize;

	if payload.len() < 4 + cipher_length || cipher_length < 16 {
		return Err(());
	}

	let ciphertext_and_tag = &payload[4..4 + cipher_length];
	let split = ciphertext_and_tag.len() - 16;
	let ciphertext = &ciphertext_and_tag[..split];
	let tag = &ciphertext_and_tag[split..];

	let nonce = crypto::gcm_nonce_from_iv(iv);
	let plaintext = crypto::decrypt(ciphertext, gcm_key, &nonce, tag).map_err(|_| ())?;

	const IV_SIZE: usize = 16;
	let rolled_iv = if cipher_length >= 16 + IV_SIZE {
		let tail = &ciphertext_and_tag[ciphertext_and_tag.len() - 16..];
		let mut iv = [0u8; 16];
		iv.copy_from_slice(tail);
		Some(iv)
	} else {
		None
	};

	Ok(DecryptedInput { plaintext, rolled_iv })
}

/// Two little-endian u16 fields: `{type: 0x0100, reason: 0x0100}`.
pub fn termination_packet() -> [u8; 4] {
	let mut buffer = [0u8; 4];
	buffer[0..2].copy_from_slice(&0x0100u16.to_le_bytes());
	buffer[2..4].copy_from_slice(&0x0100u16.to_le_bytes());
	buffer
}

/// Runs the control channel to completion on the calling thread.
pub fn run(
	runtime: Arc<SessionRuntime>,
	config: Config,
	input: Arc<dyn InputInjector>,
	process_probe: Option<Arc<dyn ProcessProbe>>,
) {
	while runtime.state.get() == State::Starting {
		std::thread::sleep(Duration::from_millis(1));
	}

	let socket_address: SocketAddr = match format!("[::]:{}", config.stream.control.port).parse() {
		Ok(address) => address,
		Err(e) => {
			tracing::error!("Failed to build control socket address: {e}");
			runtime.stop();
			return;
		},
	};

	let socket = match UdpSocket::bind(socket_address) {
		Ok(socket) => socket,
		Err(e) => {
			tracing::error!("Failed to bind control socket: {e}");
			runtime.stop();
			return;
		},
	};
	if let Err(e) = socket.set_read_timeout(Some(Duration::from_millis(500))) {
		tracing::warn!("Failed to set control socket read timeout: {e}");
	}

	let mut host = match enet::Host::new(socket, enet::HostSettings { peer_limit: 1, channel_limit: 1, ..Default::default() }) {
		Ok(host) => host,
		Err(e) => {
			tracing::error!("Failed to create control host: {e}");
			runtime.stop();
			return;
		},
	};

	let ping_timeout = Duration::from_secs(config.stream_timeout);

	loop {
		if runtime.state.get() == State::Stopping {
			break;
		}

		if runtime.ping_timed_out() {
			tracing::debug!("Control channel timed out waiting for a ping.");
			runtime.stop();
			break;
		}

		if runtime.has_process {
			if let Some(probe) = &process_probe {
				if !probe.is_running() {
					tracing::info!("Supervised process exited, sending TERMINATION.");
					send_termination(&mut host);
					runtime.stop();
					break;
				}
			}
		}

		match host.service() {
			Ok(Some(enet::Event::Receive { packet, .. })) => {
				runtime.reset_ping_deadline(ping_timeout);
				handle_packet(packet.data(), &runtime, &input);
			},
			Ok(Some(enet::Event::Disconnect { .. })) => {
				if runtime.state.get() == State::Running {
					tracing::debug!("Control peer disconnected.");
					runtime.stop();
					break;
				}
			},
			Ok(_) => {},
			Err(e) => {
				tracing::warn!("Control host service error: {e}");
			},
		}
	}

	tracing::debug!("Control channel stopped.");
	runtime.stop();
}

fn handle_packet(data: &[u8], runtime: &SessionRuntime, input: &Arc<dyn InputInjector>) {
	let Some(message) = parse(data) else {
		tracing::warn!("Malformed control packet of {} bytes.", data.len());
		return;
	};

	match message {
		ControlMessage::InvalidateReferenceFrames(request) => {
			runtime.idr_event.raise(request);
		},
		ControlMessage::InputData(payload) => {
			let iv = runtime.current_iv();
			match decrypt_input_data(payload, &runtime.gcm_key, &iv) {
				Ok(decrypted) => {
					if let Some(rolled_iv) = decrypted.rolled_iv {
						runtime.roll_iv(rolled_iv);
					}
					input.passthrough(&decrypted.plaintext);
				},
				Err(()) => {
					tracing::error!("GCM auth failure on INPUT_DATA, stopping session.");
					runtime.stop();
				},
			}
		},
		ControlMessage::Unknown(code) => {
			tracing::trace!("Ignoring unknown control message type 0x{code:04x}.");
		},
		ControlMessage::StartA | ControlMessage::StartB | ControlMessage::LossStats | ControlMessage::RumbleData | ControlMessage::Termination => {},
	}
}

fn send_termination<S: enet::Socket>(host: &mut enet::Host<S>) {
	let packet = termination_packet();
	for peer in host.connected_peers_mut() {
		let _ = peer
			.send(0, &enet::Packet::reliable(&packet))
			.map_err(|e| tracing::warn!("Failed to send TERMINATION to peer: {e}"));
	}
}
