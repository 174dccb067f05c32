//! The RTSP setup server: OPTIONS/DESCRIBE/SETUP/ANNOUNCE/PLAY dispatch over the
//! reliable-UDP transport, with one-slot request fragmentation coalescing.
//!
//! Hosted from a `tokio` task wrapped in `shutdown.wrap_cancel(shutdown.wrap_trigger_shutdown(...))`,
//! but the service loop itself runs as a blocking `rusty_enet::Host` loop (the same
//! transport `session/stream/control.rs` drives), since the reliable-UDP host has no
//! async API to await.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_shutdown::ShutdownManager;
use rtsp_types::{headers, Method, Request, Response, StatusCode, Version};
use rusty_enet as enet;

use crate::config::Config;
use crate::session::manager::SessionManager;
use crate::session::{AudioConfig, MonitorConfig, SessionConfig};

/// Exact `Session` option value SETUP returns for the audio stream.
const AUDIO_SESSION_OPTION: &str = "DEADBEEFCAFE;timeout = 90";

#[derive(Clone)]
pub struct RtspServer {
	_private: (),
}

impl RtspServer {
	pub fn new(config: Config, manager: Arc<SessionManager>, shutdown: ShutdownManager<i32>) -> Self {
		tokio::spawn({
			let shutdown = shutdown.clone();
			async move {
				let stop = Arc::new(AtomicBool::new(false));

				tokio::spawn({
					let stop = stop.clone();
					let shutdown = shutdown.clone();
					async move {
						shutdown.wait_shutdown_triggered().await;
						stop.store(true, Ordering::Release);
					}
				});

				let _ = shutdown
					.wrap_trigger_shutdown(3, tokio::task::spawn_blocking(move || run(manager, config, stop)))
					.await;

				tracing::debug!("RTSP server shutting down.");
			}
		});

		Self { _private: () }
	}
}

/// Runs the RTSP setup server to completion on the calling (blocking) thread.
/// Exits once `stop` is observed set.
fn run(manager: Arc<SessionManager>, config: Config, stop: Arc<AtomicBool>) {
	let address: SocketAddr = match (config.address.as_str(), config.stream.port).to_socket_addrs() {
		Ok(mut addresses) => match addresses.next() {
			Some(address) => address,
			None => {
				tracing::error!("Failed to resolve RTSP address {}:{}.", config.address, config.stream.port);
				return;
			},
		},
		Err(e) => {
			tracing::error!("Failed to resolve RTSP address {}:{}: {e}", config.address, config.stream.port);
			return;
		},
	};

	let socket = match UdpSocket::bind(address) {
		Ok(socket) => socket,
		Err(e) => {
			tracing::error!("Failed to bind RTSP socket on {address}: {e}");
			return;
		},
	};
	if let Err(e) = socket.set_read_timeout(Some(Duration::from_millis(500))) {
		tracing::warn!("Failed to set RTSP socket read timeout: {e}");
	}

	let mut host = match enet::Host::new(socket, enet::HostSettings { peer_limit: 1, channel_limit: 1, ..Default::default() }) {
		Ok(host) => host,
		Err(e) => {
			tracing::error!("Failed to create RTSP host: {e}");
			return;
		},
	};

	tracing::info!("RTSP server listening on {address}.");

	// One outstanding fragment buffer: a single slot, the second arrival always
	// concatenates and flushes. The host is configured for a single peer, so
	// there is never more than one connection's worth of request in flight.
	let mut pending: Option<Vec<u8>> = None;

	while !stop.load(Ordering::Acquire) {
		manager.tick_shutdown();

		match host.service() {
			Ok(Some(enet::Event::Receive { packet, .. })) => {
				let (buffer, already_stashed) = match pending.take() {
					Some(mut buffer) => {
						buffer.extend_from_slice(packet.data());
						(buffer, true)
					},
					None => (packet.data().to_vec(), false),
				};

				match try_parse_request(&buffer, already_stashed) {
					ParseOutcome::Complete(request) => {
						let response = handle_request(&manager, &config, &request);
						send_response(&mut host, &response);
					},
					ParseOutcome::NeedsMore => {
						pending = Some(buffer);
					},
					ParseOutcome::Invalid => {
						tracing::warn!("Failed to parse {}-byte RTSP request.", buffer.len());
					},
				}
			},
			Ok(Some(enet::Event::Disconnect { .. })) => {},
			Ok(Some(enet::Event::Connect { .. })) => {},
			Ok(None) => {},
			Err(e) => tracing::warn!("RTSP host service error: {e}"),
		}
	}

	manager.shutdown();

	tracing::debug!("RTSP server stopped.");
}

enum ParseOutcome {
	Complete(Request<Vec<u8>>),
	NeedsMore,
	Invalid,
}

/// Parses a buffered RTSP request, working around `rtsp_types` choking on Moonlight's
/// bare `streamid=...`/`PLAY /...` request lines.
fn try_parse_request(buffer: &[u8], already_stashed: bool) -> ParseOutcome {
	let Ok(text) = std::str::from_utf8(buffer) else {
		return ParseOutcome::Invalid;
	};
	let text = text.replace("streamid", "rtsp://localhost?streamid");
	let text = text.replace("PLAY /", "PLAY rtsp://localhost/");

	match rtsp_types::Message::parse(&text) {
		Ok((rtsp_types::Message::Request(request), _consumed)) => ParseOutcome::Complete(request),
		Ok(_) => ParseOutcome::Invalid,
		Err(rtsp_types::ParseError::Incomplete(_)) if !already_stashed => ParseOutcome::NeedsMore,
		Err(_) => ParseOutcome::Invalid,
	}
}

fn send_response<S: enet::Socket>(host: &mut enet::Host<S>, response: &Response<Vec<u8>>) {
	let mut buffer = Vec::new();
	if let Err(e) = response.write(&mut buffer) {
		tracing::error!("Failed to serialize RTSP response: {e}");
		return;
	}

	for peer in host.connected_peers_mut() {
		let _ = peer.send(0, &enet::Packet::reliable(&buffer)).map_err(|e| tracing::warn!("Failed to send RTSP response: {e}"));
	}
}

/// Dispatches one fully-parsed RTSP request. Kept free of the network transport so
/// it can be exercised directly in tests.
fn handle_request(manager: &SessionManager, config: &Config, request: &Request<Vec<u8>>) -> Response<Vec<u8>> {
	let cseq: i32 = request.header(&headers::CSEQ).and_then(|value| value.as_str().parse().ok()).unwrap_or(0);
	let version = request.version();

	tracing::debug!("Received RTSP {:?} request (CSeq {cseq}).", request.method());

	match request.method() {
		Method::Options => respond(cseq, version, StatusCode::Ok, Vec::new()),
		Method::Describe => handle_describe(manager, cseq, version),
		Method::Setup => handle_setup(config, manager, request, cseq, version),
		Method::Announce => handle_announce(manager, config, request, cseq, version),
		Method::Play => respond(cseq, version, StatusCode::Ok, Vec::new()),
		method => {
			tracing::warn!("Received request with unsupported method {method:?}");
			respond(cseq, version, StatusCode::NotFound, Vec::new())
		},
	}
}

fn handle_describe(manager: &SessionManager, cseq: i32, version: Version) -> Response<Vec<u8>> {
	let body = if manager.hevc_enabled() { "sprop-parameter-sets=AAAAAU;surround-params=NONE" } else { "surround-params=NONE" };
	respond(cseq, version, StatusCode::Ok, body.as_bytes().to_vec())
}

fn handle_setup(config: &Config, manager: &SessionManager, request: &Request<Vec<u8>>, cseq: i32, version: Version) -> Response<Vec<u8>> {
	if manager.state() == crate::session::State::Running {
		return respond(cseq, version, StatusCode::ServiceUnavailable, Vec::new());
	}

	let Some(request_uri) = request.request_uri() else {
		return respond(cseq, version, StatusCode::BadRequest, Vec::new());
	};
	let Some((name, value)) = request_uri.query_pairs().next() else {
		return respond(cseq, version, StatusCode::BadRequest, Vec::new());
	};
	if name != "streamid" {
		return respond(cseq, version, StatusCode::BadRequest, Vec::new());
	}

	let stream_type = value.split('/').next().unwrap_or("");
	let port = match stream_type {
		"video" => config.stream.video.port,
		"audio" => config.stream.audio.port,
		"control" => config.stream.control.port,
		_ => {
			tracing::warn!("SETUP for unknown stream '{stream_type}'.");
			return respond(cseq, version, StatusCode::NotFound, Vec::new());
		},
	};

	let mut builder = Response::builder(version, StatusCode::Ok)
		.header(headers::CSEQ, cseq.to_string())
		.header(headers::TRANSPORT, format!("server_port={port}"));
	if stream_type == "audio" {
		builder = builder.header(headers::SESSION, AUDIO_SESSION_OPTION.to_string());
	}
	builder.build(Vec::new())
}

fn handle_announce(manager: &SessionManager, config: &Config, request: &Request<Vec<u8>>, cseq: i32, version: Version) -> Response<Vec<u8>> {
	if manager.begin_announce().is_err() {
		return respond(cseq, version, StatusCode::ServiceUnavailable, Vec::new());
	}

	let session_config = match parse_announce_body(request.body()) {
		Ok(session_config) => session_config,
		Err(()) => {
			manager.abort_announce();
			return respond(cseq, version, StatusCode::BadRequest, Vec::new());
		},
	};

	if session_config.monitor.is_hevc() && !config.hevc_enabled {
		tracing::warn!("Rejecting ANNOUNCE requesting HEVC while HEVC is disabled.");
		manager.abort_announce();
		return respond(cseq, version, StatusCode::BadRequest, Vec::new());
	}

	if manager.complete_announce(session_config).is_err() {
		return respond(cseq, version, StatusCode::ServiceUnavailable, Vec::new());
	}

	respond(cseq, version, StatusCode::Ok, Vec::new())
}

fn respond(cseq: i32, version: Version, status: StatusCode, body: Vec<u8>) -> Response<Vec<u8>> {
	Response::builder(version, status).header(headers::CSEQ, cseq.to_string()).build(body)
}

/// Parses the SDP-like ANNOUNCE body into a [`SessionConfig`]. `s=` carries
/// the client name (currently unused downstream, kept for parity with the wire format);
/// `a=<name>:<value>` lines are attributes. Four attributes default when absent; every
/// other field is required.
fn parse_announce_body(body: &[u8]) -> Result<SessionConfig, ()> {
	let session = sdp_types::Session::parse(body).map_err(|e| tracing::warn!("Failed to parse ANNOUNCE body as SDP: {e}"))?;

	let packetsize: usize = require_attribute(&session, "x-nv-video[0].packetSize")?;
	let width: u32 = require_attribute(&session, "x-nv-video[0].clientViewportWd")?;
	let height: u32 = require_attribute(&session, "x-nv-video[0].clientViewportHt")?;
	let framerate: u32 = require_attribute(&session, "x-nv-video[0].maxFPS")?;
	let bitrate_kbps: u32 = require_attribute(&session, "x-ml-video.configuredBitrateKbps")?;
	let slices_per_frame: u32 = require_attribute(&session, "x-nv-video[0].slicesPerFrame")?;
	let num_ref_frames: u32 = require_attribute(&session, "x-nv-video[0].numRefFrames")?;
	let channels: u32 = require_attribute(&session, "x-nv-audio.surround.numChannels")?;
	let mask: u32 = require_attribute(&session, "x-nv-audio.surround.channelMask")?;

	let encoder_csc_mode: u32 = optional_attribute(&session, "x-nv-video[0].encoderCscMode", 0);
	let video_format: u32 = optional_attribute(&session, "x-nv-vqos[0].bitStreamFormat", 0);
	let dynamic_range: u32 = optional_attribute(&session, "x-nv-vqos[0].dynamicRangeMode", 0);
	let packet_duration: u32 = optional_attribute(&session, "x-nv-aqos.packetDuration", 5);

	Ok(SessionConfig {
		packetsize,
		audio: AudioConfig { channels, mask, packet_duration },
		monitor: MonitorConfig {
			height,
			width,
			framerate,
			bitrate: bitrate_kbps * 1000,
			slices_per_frame,
			num_ref_frames,
			encoder_csc_mode,
			video_format,
			dynamic_range,
		},
	})
}

fn require_attribute<F: std::str::FromStr>(session: &sdp_types::Session, name: &str) -> Result<F, ()> {
	session
		.get_first_attribute_value(name)
		.map_err(|e| tracing::warn!("Failed to read attribute {name}: {e}"))?
		.ok_or_else(|| tracing::warn!("Missing required ANNOUNCE attribute {name}."))?
		.trim()
		.parse()
		.map_err(|_| tracing::warn!("Attribute {name} could not be parsed."))
}

fn optional_attribute<F: std::str::FromStr>(session: &sdp_types::Session, name: &str, default: F) -> F {
	session
		.get_first_attribute_value(name)
		.ok()
		.flatten()
		.and_then(|value| value.trim().parse().ok())
		.unwrap_or(default)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	use crate::external::LoggingInputInjector;
	use crate::launch::LaunchHandoff;

	fn minimal_announce_body() -> Vec<u8> {
		concat!(
			"v=0\r\n",
			"s=moonlight\r\n",
			"a=x-nv-video[0].clientViewportWd:1920 \r\n",
			"a=x-nv-video[0].clientViewportHt:1080 \r\n",
			"a=x-nv-video[0].maxFPS:60 \r\n",
			"a=x-nv-video[0].packetSize:1024 \r\n",
			"a=x-nv-video[0].slicesPerFrame:1 \r\n",
			"a=x-nv-video[0].numRefFrames:1 \r\n",
			"a=x-ml-video.configuredBitrateKbps:10000 \r\n",
			"a=x-nv-audio.surround.numChannels:2 \r\n",
			"a=x-nv-audio.surround.channelMask:3 \r\n",
		)
		.as_bytes()
		.to_vec()
	}

	#[test]
	fn parses_minimal_announce_body_with_defaults() {
		let session_config = parse_announce_body(&minimal_announce_body()).unwrap();
		assert_eq!(session_config.packetsize, 1024);
		assert_eq!(session_config.monitor.width, 1920);
		assert_eq!(session_config.monitor.height, 1080);
		assert_eq!(session_config.monitor.bitrate, 10_000_000);
		assert_eq!(session_config.monitor.video_format, 0);
		assert_eq!(session_config.audio.packet_duration, 5);
		assert_eq!(session_config.audio.channels, 2);
	}

	#[test]
	fn missing_required_attribute_is_rejected() {
		let body = b"v=0\r\ns=moonlight\r\n".to_vec();
		assert!(parse_announce_body(&body).is_err());
	}

	#[test]
	fn nonzero_video_format_is_read_through() {
		let mut body = minimal_announce_body();
		body.extend_from_slice(b"a=x-nv-vqos[0].bitStreamFormat:1 \r\n");
		let session_config = parse_announce_body(&body).unwrap();
		assert!(session_config.monitor.is_hevc());
	}

	fn new_manager() -> SessionManager {
		SessionManager::new(Config::default(), Arc::new(LoggingInputInjector))
	}

	#[test]
	fn options_echoes_cseq() {
		let manager = new_manager();
		let config = Config::default();
		let request = Request::builder(Method::Options, Version::V1_0).header(headers::CSEQ, "1").build(Vec::new());
		let response = handle_request(&manager, &config, &request);
		assert_eq!(response.header(&headers::CSEQ).unwrap().as_str(), "1");
		assert_eq!(response.status(), StatusCode::Ok);
	}

	#[test]
	fn describe_body_depends_on_hevc_setting() {
		let config = Config { hevc_enabled: false, ..Config::default() };
		let manager = SessionManager::new(config.clone(), Arc::new(LoggingInputInjector));
		let request = Request::builder(Method::Describe, Version::V1_0).header(headers::CSEQ, "2").build(Vec::new());
		let response = handle_request(&manager, &config, &request);
		assert_eq!(response.body(), b"surround-params=NONE");
	}

	#[test]
	fn announce_without_launch_handoff_yields_503_and_stays_stopped() {
		let manager = new_manager();
		let config = Config::default();
		let request = Request::builder(Method::Announce, Version::V1_0).header(headers::CSEQ, "2").build(minimal_announce_body());
		let response = handle_request(&manager, &config, &request);
		assert_eq!(response.status(), StatusCode::ServiceUnavailable);
		assert_eq!(manager.state(), crate::session::State::Stopped);
	}

	fn ephemeral_config() -> Config {
		let mut config = Config::default();
		config.stream.video.port = 0;
		config.stream.audio.port = 0;
		config.stream.control.port = 0;
		config.stream_timeout = 1;
		config
	}

	#[test]
	fn announce_with_launch_handoff_succeeds_and_duplicate_is_rejected() {
		let config = ephemeral_config();
		let manager = SessionManager::new(config.clone(), Arc::new(LoggingInputInjector));
		manager.offer_launch(LaunchHandoff { gcm_key: [0u8; 16], iv: [0u8; 16], has_process: false });

		let request = Request::builder(Method::Announce, Version::V1_0).header(headers::CSEQ, "2").build(minimal_announce_body());
		let response = handle_request(&manager, &config, &request);
		assert_eq!(response.status(), StatusCode::Ok);
		assert_eq!(manager.state(), crate::session::State::Running);

		let duplicate = Request::builder(Method::Announce, Version::V1_0).header(headers::CSEQ, "3").build(minimal_announce_body());
		let response = handle_request(&manager, &config, &duplicate);
		assert_eq!(response.status(), StatusCode::ServiceUnavailable);
		assert_eq!(manager.state(), crate::session::State::Running);
	}

	#[test]
	fn hevc_announce_is_rejected_when_globally_disabled() {
		let config = Config { hevc_enabled: false, ..ephemeral_config() };
		let manager = SessionManager::new(config.clone(), Arc::new(LoggingInputInjector));
		manager.offer_launch(LaunchHandoff { gcm_key: [0u8; 16], iv: [0u8; 16], has_process: false });

		let mut body = minimal_announce_body();
		body.extend_from_slice(b"a=x-nv-vqos[0].bitStreamFormat:1 \r\n");
		let request = Request::builder(Method::Announce, Version::V1_0).header(headers::CSEQ, "2").build(body);
		let response = handle_request(&manager, &config, &request);
		assert_eq!(response.status(), StatusCode::BadRequest);
		assert_eq!(manager.state(), crate::session::State::Stopped);
	}

	fn raw_announce_datagram() -> Vec<u8> {
		let body = minimal_announce_body();
		let mut raw = Vec::new();
		raw.extend_from_slice(b"ANNOUNCE streamid=video/0 RTSP/1.0\r\n");
		raw.extend_from_slice(b"CSeq: 2\r\n");
		raw.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
		raw.extend_from_slice(b"\r\n");
		raw.extend_from_slice(&body);
		raw
	}

	/// S5 — a request split across the Content-Length boundary must stash as
	/// `NeedsMore` on the first datagram and parse identically to the unsplit
	/// request once the remainder arrives.
	#[test]
	fn fragmented_request_parses_once_reassembled() {
		let raw = raw_announce_datagram();
		let split_at = raw.len() - 5; // break partway through the SDP body
		let (first, second) = raw.split_at(split_at);

		assert!(matches!(try_parse_request(first, false), ParseOutcome::NeedsMore));

		let mut reassembled = first.to_vec();
		reassembled.extend_from_slice(second);
		match try_parse_request(&reassembled, true) {
			ParseOutcome::Complete(request) => {
				assert_eq!(request.method(), Method::Announce);
				assert_eq!(request.body(), &minimal_announce_body());
			},
			ParseOutcome::NeedsMore => panic!("still incomplete after reassembly"),
			ParseOutcome::Invalid => panic!("reassembled request failed to parse"),
		}
	}

	/// Identical content delivered as one whole datagram parses the same way.
	#[test]
	fn unfragmented_request_parses_directly() {
		let raw = raw_announce_datagram();
		match try_parse_request(&raw, false) {
			ParseOutcome::Complete(request) => assert_eq!(request.body(), &minimal_announce_body()),
			_ => panic!("expected a complete request"),
		}
	}
}
