//! Progress Poller - tracks the active course's watched time at 1 Hz and
//! advances to the next course on completion.

use std::{sync::Arc, time::Duration};

use chromiumoxide::Page;
use color_eyre::Result;
use v_utils::log;

use crate::{CourseEntry, course_switched, events::UiSink, next_course, page, session::SessionState};

/// What the poller should do after observing one tick's worth of page state
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NextAction {
	/// Keep tracking the current course
	Stay,
	/// The active course completed; switch tracking to this resource id
	Advance(String),
	/// Nothing left to watch; stop the loop entirely
	Suspend,
}

/// Derived values for one tick, computed purely from page snapshots
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TickOutcome {
	/// Unwatched seconds across the whole course list
	pub remain_seconds: u64,
	/// Seconds left in the active course
	pub active_remaining: u64,
	/// The watched counter dropped from non-zero to zero: the player silently
	/// swapped courses under the same polling slot
	pub switched: bool,
	pub next: NextAction,
}

/// Decide what one poll tick means. Kept free of the page handle so the state
/// machine is testable against synthetic snapshots.
pub fn plan_tick(prev_watched: Option<u64>, active: &CourseEntry, snapshot: &[CourseEntry]) -> TickOutcome {
	let total_all: u64 = snapshot.iter().map(|c| c.total_seconds).sum();
	let completed_all: u64 = snapshot.iter().filter(|c| c.is_complete()).map(|c| c.total_seconds).sum();
	let active_watched = if active.is_complete() { 0 } else { active.watched_seconds };
	let remain_seconds = total_all.saturating_sub(completed_all).saturating_sub(active_watched);
	let active_remaining = active.total_seconds.saturating_sub(active.watched_seconds);

	let switched = course_switched(prev_watched, active.watched_seconds);

	let next = if active.is_complete() {
		match next_course(snapshot) {
			Some(course) => NextAction::Advance(course.resource_id.clone()),
			None => NextAction::Suspend,
		}
	} else {
		NextAction::Stay
	};

	TickOutcome {
		remain_seconds,
		active_remaining,
		switched,
		next,
	}
}

pub struct ProgressPoller {
	page: Page,
	ui: UiSink,
	state: Arc<SessionState>,
	interval: Duration,
}

impl ProgressPoller {
	pub fn new(page: Page, ui: UiSink, state: Arc<SessionState>, interval: Duration) -> Self {
		Self { page, ui, state, interval }
	}

	/// Poll until every course is complete. Ticks with no active course are
	/// no-ops; a tick error is swallowed and the next tick proceeds, since the
	/// page is often mid-navigation.
	pub async fn run(self) {
		let mut prev_watched: Option<u64> = None;
		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			ticker.tick().await;
			let Some(active_id) = self.state.active_course() else {
				continue;
			};
			match self.tick(&active_id, &mut prev_watched).await {
				Ok(true) => {}
				Ok(false) => break,
				Err(e) => tracing::debug!("poller tick error (ignored): {e}"),
			}
		}

		self.state.set_active_course(None);
		self.state.poller_stopped();
		log!("Progress poller suspended, all courses complete");
	}

	/// Returns Ok(false) once the poller should suspend for good
	async fn tick(&self, active_id: &str, prev_watched: &mut Option<u64>) -> Result<bool> {
		let Some(active) = page::read_progress(&self.page, active_id).await? else {
			// Item briefly detached; treat as transient
			return Ok(true);
		};
		let snapshot = page::snapshot(&self.page).await?;
		if snapshot.is_empty() {
			return Ok(true);
		}

		let outcome = plan_tick(*prev_watched, &active, &snapshot);

		let finish_time = (chrono::Local::now() + chrono::Duration::seconds(outcome.active_remaining as i64)).format("%H:%M:%S").to_string();
		self.ui.progress(active_id, active.watched_seconds, outcome.remain_seconds, finish_time);

		if outcome.switched {
			self.ui.log("检测到课件切换，课件列表已刷新。");
			self.ui.course_list(snapshot.clone(), active.watched_seconds);
		}
		*prev_watched = Some(active.watched_seconds);

		match outcome.next {
			NextAction::Stay => Ok(true),
			NextAction::Advance(next_id) => {
				log!("Course {} complete, advancing to {}", active_id, next_id);
				self.state.set_active_course(Some(next_id));
				*prev_watched = None;
				Ok(true)
			}
			NextAction::Suspend => {
				self.ui.log("所有课件已学完。");
				Ok(false)
			}
		}
	}
}
