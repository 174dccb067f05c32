//! TOML-backed configuration: a top-level `Config` plus per-stream sub-structs.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Name of the host, used only for logging/identification.
	pub name: String,

	/// Address to bind the stream sockets to.
	pub address: String,

	/// Configuration for the RTSP setup server and the three stream workers.
	pub stream: StreamConfig,

	/// Whether HEVC is offered/accepted. When `false`, ANNOUNCE rejects a
	/// nonzero `videoFormat` with 400.
	pub hevc_enabled: bool,

	/// Seconds since the last recognized control packet after which the
	/// control thread tears the session down.
	pub stream_timeout: u64,
}

impl Config {
	pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
		let path = path.as_ref();
		let contents = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read configuration file {}", path.display()))?;
		let config: Config = toml::from_str(&contents)
			.with_context(|| format!("failed to parse configuration file {}", path.display()))?;

		Ok(config)
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			name: "Moonshine".to_string(),
			address: "0.0.0.0".to_string(),
			stream: Default::default(),
			hevc_enabled: true,
			stream_timeout: 10,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
	/// Port the RTSP setup server listens on.
	pub port: u16,

	pub video: VideoStreamConfig,
	pub audio: AudioStreamConfig,
	pub control: ControlStreamConfig,
}

impl Default for StreamConfig {
	fn default() -> Self {
		Self {
			port: 48010,
			video: Default::default(),
			audio: Default::default(),
			control: Default::default(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoStreamConfig {
	/// Port to use for streaming video data.
	pub port: u16,

	/// What percentage of data shards should be parity shards.
	pub fec_percentage: u8,
}

impl Default for VideoStreamConfig {
	fn default() -> Self {
		Self { port: 47998, fec_percentage: 20 }
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioStreamConfig {
	/// Port to use for streaming audio data.
	pub port: u16,
}

impl Default for AudioStreamConfig {
	fn default() -> Self {
		Self { port: 48000 }
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlStreamConfig {
	/// Port to use for the reliable control channel.
	pub port: u16,
}

impl Default for ControlStreamConfig {
	fn default() -> Self {
		Self { port: 47999 }
	}
}
