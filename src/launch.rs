//! The one-shot handoff produced by the (out-of-scope) pairing/launch HTTPS endpoints.

/// Carries the session's encryption material and process state from the launch
/// collaborator into the RTSP ANNOUNCE handler.
#[derive(Clone, Debug)]
pub struct LaunchHandoff {
	pub gcm_key: [u8; 16],
	pub iv: [u8; 16],
	pub has_process: bool,
}
