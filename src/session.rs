//! Session wiring - owns the page handle and the shared state both polling
//! loops touch. Replaces the original's module-level mutable flags so a
//! process could run several sessions and tear each down cleanly.

use std::sync::{
	Arc, Mutex,
	atomic::{AtomicBool, Ordering},
};

use chromiumoxide::Page;
use color_eyre::Result;
use tokio::{sync::mpsc, task::JoinHandle};
use v_utils::log;

use crate::{
	config::Settings,
	events::{Credentials, UiSink},
	guardian::{self, QrGuardian},
	login, next_course, page,
	poller::ProgressPoller,
};

/// State shared between the two polling loops and the UI push paths.
/// The atomic flags are idempotent start guards, not locks - tick bodies never
/// run in parallel, they only prevent duplicate loop spawns.
#[derive(Debug, Default)]
pub struct SessionState {
	active_course: Mutex<Option<String>>,
	poller_running: AtomicBool,
	guardian_running: AtomicBool,
}

impl SessionState {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn active_course(&self) -> Option<String> {
		self.active_course.lock().unwrap_or_else(|p| p.into_inner()).clone()
	}

	pub fn set_active_course(&self, resource_id: Option<String>) {
		*self.active_course.lock().unwrap_or_else(|p| p.into_inner()) = resource_id;
	}

	/// Returns true if the caller may start the poller (nobody else has)
	pub fn try_start_poller(&self) -> bool {
		!self.poller_running.swap(true, Ordering::SeqCst)
	}

	pub fn poller_stopped(&self) {
		self.poller_running.store(false, Ordering::SeqCst);
	}

	pub fn try_start_guardian(&self) -> bool {
		!self.guardian_running.swap(true, Ordering::SeqCst)
	}

	pub fn guardian_stopped(&self) {
		self.guardian_running.store(false, Ordering::SeqCst);
	}
}

/// One automated portal session: driver, then the two long-lived loops.
pub struct Session {
	page: Page,
	ui: UiSink,
	settings: Settings,
	state: Arc<SessionState>,
}

impl Session {
	pub fn new(page: Page, ui: UiSink, settings: Settings) -> Self {
		Self {
			page,
			ui,
			settings,
			state: SessionState::new(),
		}
	}

	pub fn state(&self) -> Arc<SessionState> {
		Arc::clone(&self.state)
	}

	/// Drive the whole flow: login loop, navigation chain, initial course-list
	/// push, initial face check, then hand off to the two polling loops.
	/// Returns their join handles so the caller owns the loops' lifetime.
	pub async fn run(&self, credentials: &mut mpsc::UnboundedReceiver<Credentials>) -> Result<Vec<JoinHandle<()>>> {
		login::run_login(&self.page, &self.ui, credentials, &self.settings).await?;
		login::navigate_to_courses(&self.page, &self.ui).await?;

		let snapshot = page::snapshot(&self.page).await?;
		let learning = next_course(&snapshot).cloned();
		let current_watched = learning.as_ref().map(|c| c.watched_seconds).unwrap_or(0);
		self.ui.course_list(snapshot, current_watched);
		self.ui.log("课件列表已更新。");
		self.state.set_active_course(learning.map(|c| c.resource_id));

		let verified = guardian::wait_initial_verification(&self.page, &self.ui, std::time::Duration::from_secs(120)).await;
		if !verified {
			// The guardian re-detects the still-open challenge on its first
			// tick, so a timed-out initial check degrades into the normal
			// challenge handling instead of aborting the session
			self.ui.log("人脸识别超时，将在学习页面继续监测二维码弹窗。");
		}

		Ok(self.spawn_loops())
	}

	/// Start the progress poller and the QR guardian, at most one of each.
	fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
		let mut handles = Vec::new();
		let interval = self.settings.poll_interval();

		if self.state.try_start_poller() {
			let poller = ProgressPoller::new(self.page.clone(), self.ui.clone(), self.state(), interval);
			handles.push(tokio::spawn(poller.run()));
		} else {
			log!("Progress poller already running, not starting a second one");
		}

		if self.state.try_start_guardian() {
			let guardian = QrGuardian::new(self.page.clone(), self.ui.clone(), self.state(), interval, self.settings.max_guardian_restarts);
			handles.push(tokio::spawn(guardian.run_supervised()));
		} else {
			log!("QR guardian already running, not starting a second one");
		}

		handles
	}

	/// Manual refresh command from the UI: re-snapshot and push the course
	/// list, reporting success or failure as a message.
	pub async fn refresh_course_list(&self) -> Result<String> {
		let snapshot = page::snapshot(&self.page).await?;
		let count = snapshot.len();
		if count > 0 {
			let current_watched = self
				.state
				.active_course()
				.and_then(|id| snapshot.iter().find(|c| c.resource_id == id))
				.map(|c| c.watched_seconds)
				.unwrap_or(0);
			self.ui.course_list(snapshot, current_watched);
		}
		Ok(refresh_message(count))
	}
}

/// User-facing verdict of a manual course-list refresh
fn refresh_message(course_count: usize) -> String {
	if course_count == 0 {
		"课件列表未找到，请确认已进入学习页面。".to_string()
	} else {
		format!("课件列表已更新，共 {course_count} 门课件。")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn start_guards_are_idempotent() {
		let state = SessionState::new();
		assert!(state.try_start_poller());
		assert!(!state.try_start_poller());
		state.poller_stopped();
		assert!(state.try_start_poller());

		assert!(state.try_start_guardian());
		assert!(!state.try_start_guardian());
		state.guardian_stopped();
		assert!(state.try_start_guardian());
	}

	#[test]
	fn guards_are_independent() {
		let state = SessionState::new();
		assert!(state.try_start_poller());
		assert!(state.try_start_guardian());
	}

	#[test]
	fn refresh_verdict_distinguishes_empty_from_found() {
		assert_eq!(refresh_message(0), "课件列表未找到，请确认已进入学习页面。");
		assert_eq!(refresh_message(1), "课件列表已更新，共 1 门课件。");
		assert_eq!(refresh_message(12), "课件列表已更新，共 12 门课件。");
	}

	#[test]
	fn active_course_round_trips() {
		let state = SessionState::new();
		assert_eq!(state.active_course(), None);
		state.set_active_course(Some("r42".to_string()));
		assert_eq!(state.active_course(), Some("r42".to_string()));
		state.set_active_course(None);
		assert_eq!(state.active_course(), None);
	}
}
