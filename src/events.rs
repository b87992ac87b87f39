//! One-way push channel towards the UI collaborator, plus the credentials
//! handoff coming back from it.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::CourseEntry;

/// Credentials the UI supplies for one login attempt
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Credentials {
	pub phone: String,
	pub password: String,
	pub captcha: String,
}

/// Events pushed from the automation side to the UI layer. The UI renders
/// them; the driver never waits on an acknowledgement.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum UiEvent {
	/// Timestamped log line
	Log(String),
	/// Base64 CAPTCHA image for the login form
	Captcha(String),
	/// Full course-list snapshot plus the active course's watched seconds
	CourseList { courses: Vec<CourseEntry>, current_watched_seconds: u64 },
	/// Per-second progress update for the active course
	Progress {
		resource_id: String,
		watched_seconds: u64,
		/// Unwatched seconds across the whole course list
		remain_seconds: u64,
		/// Estimated local finish time of the active course, `HH:MM:SS`
		finish_time: String,
	},
	/// Base64 PNG of the face-verification QR code
	QrImage(String),
	/// Raw countdown label text, pushed only when it changes
	QrCountdown(String),
	/// The challenge disappeared: face verification succeeded (the UI's `-1` sentinel)
	QrSolved,
	/// Enable/disable the credential submit control
	SendEnabled(bool),
	/// The UI should hide itself to the tray
	HideWindow,
}

/// Cloneable sender half of the UI channel. Pushes are best-effort: a closed
/// receiver downgrades to a tracing line instead of failing the loops.
#[derive(Clone)]
pub struct UiSink {
	tx: mpsc::UnboundedSender<UiEvent>,
	last_log: Arc<Mutex<Option<String>>>,
}

impl UiSink {
	pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx, last_log: Arc::new(Mutex::new(None)) }, rx)
	}

	pub fn push(&self, event: UiEvent) {
		if self.tx.send(event).is_err() {
			tracing::debug!("UI receiver gone, dropping event");
		}
	}

	/// Push a timestamped log line, suppressing consecutive duplicates so the
	/// 1 Hz loops cannot flood the UI with the same message.
	pub fn log(&self, msg: impl AsRef<str>) {
		let msg = msg.as_ref();
		{
			let mut last = self.last_log.lock().unwrap_or_else(|p| p.into_inner());
			if last.as_deref() == Some(msg) {
				return;
			}
			*last = Some(msg.to_string());
		}
		let stamped = format!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), msg);
		self.push(UiEvent::Log(stamped));
	}

	pub fn captcha(&self, base64_image: String) {
		self.push(UiEvent::Captcha(base64_image));
	}

	pub fn course_list(&self, courses: Vec<CourseEntry>, current_watched_seconds: u64) {
		self.push(UiEvent::CourseList { courses, current_watched_seconds });
	}

	pub fn progress(&self, resource_id: &str, watched_seconds: u64, remain_seconds: u64, finish_time: String) {
		self.push(UiEvent::Progress {
			resource_id: resource_id.to_string(),
			watched_seconds,
			remain_seconds,
			finish_time,
		});
	}

	pub fn qr_image(&self, base64_image: String) {
		self.push(UiEvent::QrImage(base64_image));
	}

	pub fn qr_countdown(&self, text: String) {
		self.push(UiEvent::QrCountdown(text));
	}

	pub fn qr_solved(&self) {
		self.push(UiEvent::QrSolved);
	}

	pub fn send_enabled(&self, enabled: bool) {
		self.push(UiEvent::SendEnabled(enabled));
	}

	pub fn hide_window(&self) {
		self.push(UiEvent::HideWindow);
	}
}
