//! The process-wide session singleton: state atom, launch handoff, and the
//! spawn/join lifecycle of the three stream workers.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::Config;
use crate::external::{InputInjector, ProcessProbe};
use crate::launch::LaunchHandoff;
use crate::queue::Event;
use crate::session::stream::{audio, control, video};
use crate::session::{SessionConfig, SessionRuntime, State, StateAtom};

struct ActiveSession {
	runtime: Arc<SessionRuntime>,
	video: JoinHandle<()>,
	audio: JoinHandle<()>,
	control: JoinHandle<()>,
}

/// Coordinates the state atom, the one-shot launch handoff, and the lifetime of
/// the (at most one) active streaming session. One instance lives for the life
/// of the process.
pub struct SessionManager {
	config: Config,
	state: Arc<StateAtom>,
	launch_handoff: Event<LaunchHandoff>,
	input: Arc<dyn InputInjector>,
	process_probe: Mutex<Option<Arc<dyn ProcessProbe>>>,
	active: Mutex<Option<ActiveSession>>,
}

impl SessionManager {
	pub fn new(config: Config, input: Arc<dyn InputInjector>) -> Self {
		Self {
			config,
			state: Arc::new(StateAtom::new()),
			launch_handoff: Event::new(),
			input,
			process_probe: Mutex::new(None),
			active: Mutex::new(None),
		}
	}

	pub fn state(&self) -> State {
		self.state.get()
	}

	pub fn hevc_enabled(&self) -> bool {
		self.config.hevc_enabled
	}

	/// Called by the (out-of-scope) launch collaborator when it hands off a new session.
	pub fn offer_launch(&self, handoff: LaunchHandoff) {
		self.launch_handoff.raise(handoff);
	}

	#[allow(dead_code)]
	pub fn set_process_probe(&self, probe: Arc<dyn ProcessProbe>) {
		*self.process_probe.lock().unwrap() = Some(probe);
	}

	/// Step 1 of the ANNOUNCE sequence: CAS STOPPED -> STARTING. `Err` means the
	/// caller should respond 503 Service Unavailable.
	pub fn begin_announce(&self) -> Result<(), ()> {
		if self.state.cas(State::Stopped, State::Starting) {
			Ok(())
		} else {
			Err(())
		}
	}

	/// Reverts a STARTING announce back to STOPPED after a body parse/validation failure.
	pub fn abort_announce(&self) {
		self.state.store(State::Stopped);
	}

	/// Steps 2-8 of the ANNOUNCE sequence: pop the launch handoff, build the
	/// session runtime, spawn the three worker threads, and mark RUNNING.
	/// `Err` means no launch handoff was pending; the caller should respond 503
	/// and the state has already been reverted to STOPPED.
	pub fn complete_announce(&self, session_config: SessionConfig) -> Result<(), ()> {
		let Some(handoff) = self.launch_handoff.pop() else {
			tracing::warn!("ANNOUNCE arrived with no pending launch handoff.");
			self.abort_announce();
			return Err(());
		};

		let ping_timeout = Duration::from_secs(self.config.stream_timeout);
		let runtime = Arc::new(SessionRuntime::new(
			self.state.clone(),
			handoff.gcm_key,
			handoff.iv,
			handoff.has_process,
			session_config,
			ping_timeout,
		));

		let video_handle = {
			let runtime = runtime.clone();
			let config = self.config.clone();
			std::thread::spawn(move || video::run(runtime, config))
		};
		let audio_handle = {
			let runtime = runtime.clone();
			let config = self.config.clone();
			std::thread::spawn(move || audio::run(runtime, config))
		};
		let control_handle = {
			let runtime = runtime.clone();
			let config = self.config.clone();
			let input = self.input.clone();
			let process_probe = self.process_probe.lock().unwrap().clone();
			std::thread::spawn(move || control::run(runtime, config, input, process_probe))
		};

		*self.active.lock().unwrap() = Some(ActiveSession {
			runtime,
			video: video_handle,
			audio: audio_handle,
			control: control_handle,
		});

		self.state.store(State::Running);
		tracing::info!("Session started.");
		Ok(())
	}

	/// Drives the shutdown sequence. Intended to be polled once per RTSP loop
	/// iteration: once the session is STOPPING, joins the workers in order
	/// (audio, then video, then control), resets the input injector, and stores
	/// STOPPED.
	pub fn tick_shutdown(&self) {
		if self.state.get() != State::Stopping {
			return;
		}

		let Some(active) = self.active.lock().unwrap().take() else {
			self.state.store(State::Stopped);
			return;
		};

		active.runtime.stop();

		if active.audio.join().is_err() {
			tracing::warn!("Audio stream worker panicked.");
		}
		if active.video.join().is_err() {
			tracing::warn!("Video stream worker panicked.");
		}
		if active.control.join().is_err() {
			tracing::warn!("Control stream worker panicked.");
		}

		self.input.reset();
		self.state.store(State::Stopped);
		tracing::info!("Session stopped.");
	}

	/// Called once on process shutdown: ensures an in-flight session is torn down
	/// before the process exits.
	pub fn shutdown(&self) {
		while self.state.get() == State::Starting {
			std::thread::sleep(Duration::from_millis(1));
		}

		if let Some(active) = self.active.lock().unwrap().as_ref() {
			active.runtime.stop();
		}

		self.tick_shutdown();
	}
}
