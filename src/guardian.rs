//! QR Guardian - watches the face-verification challenge popup, keeps its
//! countdown fresh in the UI, refreshes expired codes, and reports success
//! when the popup disappears.

use std::{
	sync::{Arc, LazyLock},
	time::{Duration, Instant},
};

use chromiumoxide::Page;
use color_eyre::{Result, eyre::eyre};
use regex::Regex;
use v_utils::elog;

use crate::{events::UiSink, page, poller, session::SessionState};

static COUNTDOWN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)分\s*(\d+)秒").expect("countdown regex is a literal"));

/// Visibility reads failing this many ticks in a row mean the page handle
/// itself broke, not a briefly detached element; escalate to a restart.
const MAX_VISIBILITY_FAILURES: u32 = 3;

/// Extract remaining seconds from the countdown label (`2分30秒`, `0分 0秒`).
/// Returns `None` for text without the minutes/seconds pattern.
pub fn parse_countdown(text: &str) -> Option<u64> {
	let caps = COUNTDOWN_RE.captures(text)?;
	let minutes: u64 = caps.get(1)?.as_str().parse().ok()?;
	let seconds: u64 = caps.get(2)?.as_str().parse().ok()?;
	Some(minutes * 60 + seconds)
}

/// The challenge has run out: the label reads zero minutes zero seconds
/// (the portal renders both `0分0秒` and `0分 0秒`)
pub fn countdown_expired(text: &str) -> bool {
	parse_countdown(text) == Some(0)
}

/// Guards the QR refresh action against re-entrant triggers: the expiry text
/// stays on screen for a moment after the reload click, and must not fire a
/// second refresh within the window.
#[derive(Debug)]
pub struct RefreshCooldown {
	window: Duration,
	last_fired: Option<Instant>,
}

impl RefreshCooldown {
	pub fn new(window: Duration) -> Self {
		Self { window, last_fired: None }
	}

	/// Returns true and arms the cooldown if enough time has passed since the
	/// previous fire
	pub fn try_fire(&mut self, now: Instant) -> bool {
		if let Some(last) = self.last_fired {
			if now.duration_since(last) < self.window {
				return false;
			}
		}
		self.last_fired = Some(now);
		true
	}
}

/// What one guardian tick should do, decided from the observed edges
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChallengeOutcome {
	/// Idle → Challenged edge: announce the popup and push its image
	pub appeared: bool,
	/// Countdown label to forward, present only when its text changed
	pub countdown_push: Option<String>,
	/// The countdown expired and the cooldown allows a reload
	pub refresh: bool,
	/// Challenged → Idle edge: face verification succeeded
	pub solved: bool,
}

/// Decide what one guardian tick means. Mirrors the poller's tick planner:
/// kept free of the page handle so the Idle/Challenged edges are testable
/// against synthetic observations.
pub fn plan_challenge_tick(
	visible: bool,
	last_visible: bool,
	countdown: Option<&str>,
	last_countdown: Option<&str>,
	cooldown: &mut RefreshCooldown,
	now: Instant,
) -> ChallengeOutcome {
	let appeared = visible && !last_visible;
	let solved = !visible && last_visible;

	// A fresh popup starts with a clean memo, so its first label always pushes
	let effective_last = if appeared { None } else { last_countdown };
	let countdown_push = match countdown {
		Some(text) if visible && effective_last != Some(text) => Some(text.to_string()),
		_ => None,
	};

	let refresh = visible && countdown.map(countdown_expired).unwrap_or(false) && cooldown.try_fire(now);

	ChallengeOutcome {
		appeared,
		countdown_push,
		refresh,
		solved,
	}
}

/// Decide the delayed-hide push after a solve: only when the popup is
/// confirmedly gone. A failed read (`None`) skips the hide - the same
/// transient class as any other tick read, never a guardian crash.
fn should_hide_after_solve(visible_after_grace: Option<bool>) -> bool {
	visible_after_grace == Some(false)
}

pub struct QrGuardian {
	page: Page,
	ui: UiSink,
	state: Arc<SessionState>,
	interval: Duration,
	max_restarts: u32,
}

impl QrGuardian {
	pub fn new(page: Page, ui: UiSink, state: Arc<SessionState>, interval: Duration, max_restarts: u32) -> Self {
		Self {
			page,
			ui,
			state,
			interval,
			max_restarts,
		}
	}

	/// Run the guardian, restarting it after unexpected failures. Each restart
	/// reuses the same page handle after a fixed 5 s delay; the restart count
	/// is bounded so a permanently broken page cannot spin forever.
	pub async fn run_supervised(self) {
		let mut restarts = 0u32;
		loop {
			match self.run().await {
				Ok(()) => break,
				Err(e) => {
					restarts += 1;
					if restarts > self.max_restarts {
						elog!("QR guardian failed {restarts} times, giving up: {e}");
						self.ui.log("二维码守护进程多次失败，已停止，请重启程序。");
						break;
					}
					elog!("QR guardian crashed (restart {restarts}/{}): {e}", self.max_restarts);
					tokio::time::sleep(Duration::from_secs(5)).await;
				}
			}
		}
		self.state.guardian_stopped();
	}

	/// The Idle/Challenged polling loop. Per-tick read failures are swallowed
	/// with a 5 s pause; only visibility staying unreadable for several ticks
	/// in a row escapes as a guardian crash.
	async fn run(&self) -> Result<()> {
		let mut last_visible = false;
		let mut last_countdown: Option<String> = None;
		let mut cooldown = RefreshCooldown::new(Duration::from_secs(2));
		let mut visibility_failures = 0u32;

		loop {
			tokio::time::sleep(self.interval).await;

			let visible = match page::challenge_visible(&self.page).await {
				Ok(v) => v,
				Err(e) => {
					visibility_failures += 1;
					if visibility_failures >= MAX_VISIBILITY_FAILURES {
						return Err(eyre!("challenge visibility unreadable {} ticks in a row: {}", visibility_failures, e));
					}
					tracing::debug!("challenge visibility read failed: {e}");
					tokio::time::sleep(Duration::from_secs(5)).await;
					continue;
				}
			};
			visibility_failures = 0;

			let countdown = if visible {
				match page::countdown_text(&self.page).await {
					Ok(text) => Some(text),
					Err(e) => {
						// Element briefly detached mid-refresh; wait out the
						// transient without restarting the whole guardian
						tracing::debug!("countdown read failed: {e}");
						tokio::time::sleep(Duration::from_secs(5)).await;
						last_visible = visible;
						continue;
					}
				}
			} else {
				None
			};

			let outcome = plan_challenge_tick(visible, last_visible, countdown.as_deref(), last_countdown.as_deref(), &mut cooldown, Instant::now());

			if outcome.appeared {
				self.ui.log("检测到二维码弹窗出现，请微信扫码进行人脸识别。");
				match page::challenge_image(&self.page).await {
					Ok(img) => self.ui.qr_image(img),
					Err(e) => tracing::debug!("challenge image fetch failed: {e}"),
				}
			}
			if let Some(text) = &outcome.countdown_push {
				self.ui.qr_countdown(text.clone());
			}
			if outcome.refresh {
				if let Err(e) = self.refresh_qr().await {
					tracing::debug!("QR refresh failed: {e}");
					tokio::time::sleep(Duration::from_secs(5)).await;
				}
			}
			if outcome.solved {
				self.on_challenge_solved().await;
			}

			last_countdown = countdown;
			last_visible = visible;
		}
	}

	/// Click the reload control and push the fresh code
	async fn refresh_qr(&self) -> Result<()> {
		self.ui.log("二维码已过期，正在自动刷新...");
		page::click_reload_qr(&self.page).await?;
		tokio::time::sleep(Duration::from_secs(1)).await;
		let img = page::challenge_image(&self.page).await?;
		self.ui.qr_image(img);
		self.ui.log("二维码已刷新，请微信扫码进行人脸识别。");
		Ok(())
	}

	/// The popup disappearing is the success signal: notify the UI, re-push
	/// the active course's progress once, then ask the UI to hide itself -
	/// unless the challenge reappears within 3 s.
	async fn on_challenge_solved(&self) {
		self.ui.qr_solved();
		self.ui.log("人脸识别成功。");

		if let Some(active_id) = self.state.active_course() {
			if let Ok(Some(entry)) = page::read_progress(&self.page, &active_id).await {
				let snapshot = page::snapshot(&self.page).await.unwrap_or_default();
				let outcome = poller::plan_tick(None, &entry, &snapshot);
				let finish_time = (chrono::Local::now() + chrono::Duration::seconds(outcome.active_remaining as i64)).format("%H:%M:%S").to_string();
				self.ui.progress(&active_id, entry.watched_seconds, outcome.remain_seconds, finish_time);
			}
		}

		tokio::time::sleep(Duration::from_secs(3)).await;
		let visible_after_grace = page::challenge_visible(&self.page).await.ok();
		if visible_after_grace.is_none() {
			tracing::debug!("visibility check after solve failed, skipping hide");
		}
		if should_hide_after_solve(visible_after_grace) {
			self.ui.log("二维码弹窗消失，自动隐藏窗口到托盘。");
			self.ui.hide_window();
		}
	}
}

/// Initial face check right after the navigation chain: push the first QR code
/// and wait up to `timeout` for the user to pass it. Returns false on timeout.
pub async fn wait_initial_verification(page: &Page, ui: &UiSink, timeout: Duration) -> bool {
	match page::challenge_image(page).await {
		Ok(img) => {
			ui.qr_image(img);
			ui.log("请打开微信扫描右侧二维码进行人脸识别。");
		}
		Err(e) => {
			tracing::debug!("initial challenge image fetch failed: {e}");
			return true;
		}
	}

	let deadline = tokio::time::Instant::now() + timeout;
	while tokio::time::Instant::now() < deadline {
		tokio::time::sleep(Duration::from_secs(1)).await;
		match page::challenge_visible(page).await {
			Ok(false) => {
				ui.qr_solved();
				ui.log("按照历史播放进度，继续开始播放视频。");
				return true;
			}
			Ok(true) => {}
			Err(e) => tracing::debug!("initial verification check failed: {e}"),
		}
	}
	ui.log("等待人脸识别超时。");
	false
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn countdown_parsing() {
		assert_eq!(parse_countdown("2分30秒"), Some(150));
		assert_eq!(parse_countdown("0分0秒"), Some(0));
		assert_eq!(parse_countdown("0分 0秒"), Some(0));
		assert_eq!(parse_countdown("剩余 1分05秒"), Some(65));
		assert_eq!(parse_countdown("loading"), None);
		assert_eq!(parse_countdown(""), None);
	}

	#[test]
	fn expiry_matches_both_sentinel_spellings() {
		assert!(countdown_expired("0分0秒"));
		assert!(countdown_expired("0分 0秒"));
		assert!(!countdown_expired("0分1秒"));
		assert!(!countdown_expired("1分0秒"));
		assert!(!countdown_expired("garbage"));
	}

	#[test]
	fn refresh_fires_once_within_cooldown() {
		let mut cooldown = RefreshCooldown::new(Duration::from_secs(2));
		let t0 = Instant::now();
		assert!(cooldown.try_fire(t0));
		// Same expiry text observed again one tick later: suppressed
		assert!(!cooldown.try_fire(t0 + Duration::from_secs(1)));
		assert!(!cooldown.try_fire(t0 + Duration::from_millis(1999)));
		// Past the window a new expiry may fire again
		assert!(cooldown.try_fire(t0 + Duration::from_secs(2)));
		assert!(!cooldown.try_fire(t0 + Duration::from_secs(3)));
	}

	#[test]
	fn cooldown_first_fire_is_free() {
		let mut cooldown = RefreshCooldown::new(Duration::from_secs(2));
		assert!(cooldown.try_fire(Instant::now()));
	}

	#[test]
	fn appear_edge_announces_and_pushes_first_countdown() {
		let mut cooldown = RefreshCooldown::new(Duration::from_secs(2));
		// Stale memo from a previous popup must not suppress the first label
		let outcome = plan_challenge_tick(true, false, Some("2分30秒"), Some("2分30秒"), &mut cooldown, Instant::now());
		assert!(outcome.appeared);
		assert_eq!(outcome.countdown_push, Some("2分30秒".to_string()));
		assert!(!outcome.refresh);
		assert!(!outcome.solved);
	}

	#[test]
	fn challenged_tick_pushes_countdown_only_on_change() {
		let mut cooldown = RefreshCooldown::new(Duration::from_secs(2));
		let now = Instant::now();
		let unchanged = plan_challenge_tick(true, true, Some("2分29秒"), Some("2分29秒"), &mut cooldown, now);
		assert_eq!(unchanged.countdown_push, None);
		let changed = plan_challenge_tick(true, true, Some("2分28秒"), Some("2分29秒"), &mut cooldown, now);
		assert_eq!(changed.countdown_push, Some("2分28秒".to_string()));
		assert!(!changed.appeared && !changed.solved && !changed.refresh);
	}

	#[test]
	fn expiry_refreshes_once_per_cooldown_window() {
		let mut cooldown = RefreshCooldown::new(Duration::from_secs(2));
		let t0 = Instant::now();
		let first = plan_challenge_tick(true, true, Some("0分0秒"), Some("0分1秒"), &mut cooldown, t0);
		assert!(first.refresh);
		// The same expiry text one tick later stays within the cooldown
		let second = plan_challenge_tick(true, true, Some("0分0秒"), Some("0分0秒"), &mut cooldown, t0 + Duration::from_secs(1));
		assert!(!second.refresh);
		let third = plan_challenge_tick(true, true, Some("0分0秒"), Some("0分0秒"), &mut cooldown, t0 + Duration::from_secs(2));
		assert!(third.refresh);
	}

	#[test]
	fn solve_edge_reports_success_only() {
		let mut cooldown = RefreshCooldown::new(Duration::from_secs(2));
		let outcome = plan_challenge_tick(false, true, None, Some("1分0秒"), &mut cooldown, Instant::now());
		assert!(outcome.solved);
		assert!(!outcome.appeared);
		assert_eq!(outcome.countdown_push, None);
		assert!(!outcome.refresh);
	}

	#[test]
	fn idle_steady_state_is_a_noop() {
		let mut cooldown = RefreshCooldown::new(Duration::from_secs(2));
		let outcome = plan_challenge_tick(false, false, None, None, &mut cooldown, Instant::now());
		assert_eq!(
			outcome,
			ChallengeOutcome {
				appeared: false,
				countdown_push: None,
				refresh: false,
				solved: false,
			}
		);
	}

	#[test]
	fn hide_only_when_popup_confirmedly_gone() {
		assert!(should_hide_after_solve(Some(false)));
		// Reappeared within the grace window: the success did not stick
		assert!(!should_hide_after_solve(Some(true)));
		// Read failed: skip the hide, never treat it as a crash
		assert!(!should_hide_after_solve(None));
	}
}
