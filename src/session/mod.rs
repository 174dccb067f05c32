//! The session state atom and the runtime shared by the three stream workers.

pub mod manager;
pub mod stream;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::external::{AudioFrame, EncodedFrame, IdrRequest};
use crate::queue::{Event, Queue};

/// Process-wide session state: STOPPED, STARTING, RUNNING, STOPPING. The allowed
/// transitions are enforced via [`StateAtom::cas`] at every edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
	Stopped = 0,
	Starting = 1,
	Running = 2,
	Stopping = 3,
}

impl State {
	fn from_u8(value: u8) -> Self {
		match value {
			0 => Self::Stopped,
			1 => Self::Starting,
			2 => Self::Running,
			_ => Self::Stopping,
		}
	}
}

/// Single-word atomic backing the session state machine.
pub struct StateAtom(AtomicU8);

impl Default for StateAtom {
	fn default() -> Self {
		Self::new()
	}
}

impl StateAtom {
	pub fn new() -> Self {
		Self(AtomicU8::new(State::Stopped as u8))
	}

	pub fn get(&self) -> State {
		State::from_u8(self.0.load(Ordering::Acquire))
	}

	pub fn store(&self, state: State) {
		self.0.store(state as u8, Ordering::Release);
	}

	/// Atomically transitions `current -> new`, returning whether it took effect.
	pub fn cas(&self, current: State, new: State) -> bool {
		self.0
			.compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}
}

/// Fields populated from the RTSP ANNOUNCE body.
#[derive(Clone, Debug)]
pub struct SessionConfig {
	pub packetsize: usize,
	pub audio: AudioConfig,
	pub monitor: MonitorConfig,
}

#[derive(Clone, Debug)]
pub struct AudioConfig {
	pub channels: u32,
	pub mask: u32,
	pub packet_duration: u32,
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
	pub height: u32,
	pub width: u32,
	pub framerate: u32,
	pub bitrate: u32,
	pub slices_per_frame: u32,
	pub num_ref_frames: u32,
	pub encoder_csc_mode: u32,
	/// 0 = H.264, nonzero = HEVC.
	pub video_format: u32,
	pub dynamic_range: u32,
}

impl MonitorConfig {
	pub fn is_hevc(&self) -> bool {
		self.video_format != 0
	}
}

/// Runtime state shared by the RTSP thread and the three stream workers for the
/// lifetime of one streaming session. `state` is the process-wide atom owned by the
/// [`manager`] singleton and shared in here, since STOPPED must be observable even
/// before a `SessionRuntime` exists.
pub struct SessionRuntime {
	pub state: Arc<StateAtom>,
	pub gcm_key: [u8; 16],
	pub iv: Mutex<[u8; 16]>,
	pub ping_deadline: Mutex<Instant>,
	pub has_process: bool,
	pub config: SessionConfig,
	pub video_queue: Queue<EncodedFrame>,
	pub audio_queue: Queue<AudioFrame>,
	pub idr_event: Event<IdrRequest>,
}

impl SessionRuntime {
	pub fn new(
		state: Arc<StateAtom>,
		gcm_key: [u8; 16],
		iv: [u8; 16],
		has_process: bool,
		config: SessionConfig,
		ping_timeout: std::time::Duration,
	) -> Self {
		Self {
			state,
			gcm_key,
			iv: Mutex::new(iv),
			ping_deadline: Mutex::new(Instant::now() + ping_timeout),
			has_process,
			config,
			video_queue: Queue::unbounded(),
			audio_queue: Queue::unbounded(),
			idr_event: Event::new(),
		}
	}

	pub fn reset_ping_deadline(&self, ping_timeout: std::time::Duration) {
		*self.ping_deadline.lock().unwrap() = Instant::now() + ping_timeout;
	}

	pub fn ping_timed_out(&self) -> bool {
		Instant::now() > *self.ping_deadline.lock().unwrap()
	}

	pub fn current_iv(&self) -> [u8; 16] {
		*self.iv.lock().unwrap()
	}

	pub fn roll_iv(&self, new_iv: [u8; 16]) {
		*self.iv.lock().unwrap() = new_iv;
	}

	/// Marks queues stopped (waking blocked consumers) and transitions RUNNING -> STOPPING.
	/// Idempotent: safe to call from any of the worker threads, any number of times.
	pub fn stop(&self) {
		self.video_queue.stop();
		self.audio_queue.stop();
		self.idr_event.stop();
		self.state.cas(State::Running, State::Stopping);
	}
}
