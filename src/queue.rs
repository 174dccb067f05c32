//! Blocking synchronization primitives shared by the stream worker threads.
//!
//! `Queue<T>` backs the video/audio frame queues; `Event<T>` backs the launch
//! handoff and the IDR-refresh channel. Both support a `stop()` that wakes
//! every blocked consumer instead of threading cancellation tokens through
//! every call site.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError, Sender};

const POP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// FIFO queue with a cooperative stop signal.
pub struct Queue<T> {
	tx: Sender<T>,
	rx: Receiver<T>,
	stopped: AtomicBool,
}

impl<T> Queue<T> {
	pub fn unbounded() -> Self {
		let (tx, rx) = channel::unbounded();
		Self { tx, rx, stopped: AtomicBool::new(false) }
	}

	#[allow(dead_code)]
	pub fn bounded(capacity: usize) -> Self {
		let (tx, rx) = channel::bounded(capacity);
		Self { tx, rx, stopped: AtomicBool::new(false) }
	}

	/// Enqueue an item. Fails silently (returns `Err`) once the queue is stopped.
	pub fn raise(&self, item: T) -> Result<(), ()> {
		if self.stopped.load(Ordering::Acquire) {
			return Err(());
		}
		self.tx.send(item).map_err(|_| ())
	}

	/// Block until an item is available, the queue is stopped, or the sender side is dropped.
	pub fn pop(&self) -> Option<T> {
		loop {
			match self.rx.recv_timeout(POP_POLL_INTERVAL) {
				Ok(item) => return Some(item),
				Err(RecvTimeoutError::Disconnected) => return None,
				Err(RecvTimeoutError::Timeout) => {
					if self.stopped.load(Ordering::Acquire) {
						// Drain whatever is left without blocking, then stop.
						return self.rx.try_recv().ok();
					}
				},
			}
		}
	}

	/// Wake every blocked `pop()` and make future `raise()` calls fail.
	pub fn stop(&self) {
		self.stopped.store(true, Ordering::Release);
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped.load(Ordering::Acquire)
	}
}

/// Single-slot primitive: `raise` replaces the held value, `pop` consumes and clears it.
pub struct Event<T> {
	slot: Mutex<Option<T>>,
	condvar: Condvar,
	stopped: AtomicBool,
}

impl<T: Clone> Event<T> {
	pub fn new() -> Self {
		Self {
			slot: Mutex::new(None),
			condvar: Condvar::new(),
			stopped: AtomicBool::new(false),
		}
	}

	pub fn raise(&self, value: T) {
		*self.slot.lock().unwrap() = Some(value);
		self.condvar.notify_all();
	}

	/// Take the held value, if any, without blocking.
	pub fn pop(&self) -> Option<T> {
		self.slot.lock().unwrap().take()
	}

	#[allow(dead_code)]
	pub fn peek(&self) -> bool {
		self.slot.lock().unwrap().is_some()
	}

	pub fn stop(&self) {
		self.stopped.store(true, Ordering::Release);
		self.condvar.notify_all();
	}
}

impl<T: Clone> Default for Event<T> {
	fn default() -> Self {
		Self::new()
	}
}
