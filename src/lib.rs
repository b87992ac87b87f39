use serde::{Deserialize, Serialize};

pub mod config;
pub mod events;
pub mod guardian;
pub mod login;
pub mod page;
pub mod poller;
pub mod session;

/// Portal label text for a finished course item
pub const LABEL_FINISHED: &str = "已学完";
/// Portal label text for a course item currently being watched
pub const LABEL_IN_PROGRESS: &str = "学习中";

/// Learning state of one course item, as shown on the course page
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum CourseStatus {
	NotStarted,
	InProgress,
	Completed,
}

impl CourseStatus {
	/// Derive status from the item's completion-label text and its second counters.
	/// Label text wins over the counters; first match applies.
	pub fn derive(label: Option<&str>, watched_seconds: u64, total_seconds: u64) -> Self {
		if let Some(label) = label {
			if label.contains(LABEL_FINISHED) {
				return CourseStatus::Completed;
			}
			if label.contains(LABEL_IN_PROGRESS) {
				return CourseStatus::InProgress;
			}
		}
		if watched_seconds == total_seconds && total_seconds > 0 {
			return CourseStatus::Completed;
		}
		if watched_seconds > 0 {
			return CourseStatus::InProgress;
		}
		CourseStatus::NotStarted
	}
}

/// One course item's progress record, re-read from the live page on every poll
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CourseEntry {
	/// The page's `data-resourceid` attribute, unique within a session
	pub resource_id: String,
	pub name: String,
	pub status: CourseStatus,
	pub total_seconds: u64,
	pub watched_seconds: u64,
}

impl CourseEntry {
	/// Unified completion predicate: explicit Completed status, or the counters
	/// having caught up. The page can transiently report watched > total.
	pub fn is_complete(&self) -> bool {
		self.status == CourseStatus::Completed || (self.watched_seconds >= self.total_seconds && self.total_seconds > 0)
	}

	/// Total duration as `HH:MM:SS`
	pub fn duration(&self) -> String {
		format_duration(self.total_seconds)
	}
}

/// Pick the course to track next once the active one completes: prefer an
/// entry the portal already marks InProgress, else the first incomplete one.
pub fn next_course(snapshot: &[CourseEntry]) -> Option<&CourseEntry> {
	snapshot
		.iter()
		.find(|c| c.status == CourseStatus::InProgress && !c.is_complete())
		.or_else(|| snapshot.iter().find(|c| !c.is_complete()))
}

/// Course-switch heuristic: the watched counter dropping from non-zero to zero
/// means the player silently moved to a different physical course.
pub fn course_switched(prev_watched: Option<u64>, current_watched: u64) -> bool {
	matches!(prev_watched, Some(prev) if prev > 0 && current_watched == 0)
}

/// Format seconds as `HH:MM:SS`
pub fn format_duration(seconds: u64) -> String {
	format!("{:02}:{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
}

/// Parse a `HH:MM:SS` or `MM:SS` duration back into seconds
pub fn parse_duration(text: &str) -> u64 {
	let parts: Vec<u64> = text.split(':').map(|p| p.parse().unwrap_or(0)).collect();
	match parts.as_slice() {
		[h, m, s] => h * 3600 + m * 60 + s,
		[m, s] => m * 60 + s,
		_ => 0,
	}
}

/// Classified server feedback after a login attempt
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoginFeedback {
	Success,
	UserNotFound,
	WrongPassword,
	WrongCaptcha,
	Unknown,
}

impl LoginFeedback {
	/// Classify the `p.success` feedback text the portal renders after form submission
	pub fn classify(text: &str) -> Self {
		match text.trim() {
			"登录成功" => LoginFeedback::Success,
			"没有用户" => LoginFeedback::UserNotFound,
			"密码错误" => LoginFeedback::WrongPassword,
			"验证码错误" => LoginFeedback::WrongCaptcha,
			_ => LoginFeedback::Unknown,
		}
	}

	/// Log line shown to the user for each outcome
	pub fn message(&self) -> &'static str {
		match self {
			LoginFeedback::Success => "登陆成功！",
			LoginFeedback::UserNotFound => "手机号输入错误，请重新输入。",
			LoginFeedback::WrongPassword => "手机号或密码错误，请重新输入。",
			LoginFeedback::WrongCaptcha => "验证码错误，请重新输入。",
			LoginFeedback::Unknown => "判定结果：登录失败或验证码错误，请重新输入。",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(id: &str, status: CourseStatus, total: u64, watched: u64) -> CourseEntry {
		CourseEntry {
			resource_id: id.to_string(),
			name: format!("course {id}"),
			status,
			total_seconds: total,
			watched_seconds: watched,
		}
	}

	#[test]
	fn status_label_wins_over_counters() {
		assert_eq!(CourseStatus::derive(Some("已学完"), 0, 600), CourseStatus::Completed);
		assert_eq!(CourseStatus::derive(Some("学习中"), 600, 600), CourseStatus::InProgress);
	}

	#[test]
	fn status_counters_without_label() {
		assert_eq!(CourseStatus::derive(None, 600, 600), CourseStatus::Completed);
		assert_eq!(CourseStatus::derive(None, 1, 600), CourseStatus::InProgress);
		assert_eq!(CourseStatus::derive(None, 0, 600), CourseStatus::NotStarted);
		// total == 0 never counts as completed
		assert_eq!(CourseStatus::derive(None, 0, 0), CourseStatus::NotStarted);
	}

	#[test]
	fn completion_predicate_tolerates_overshoot() {
		assert!(entry("a", CourseStatus::InProgress, 600, 600).is_complete());
		assert!(entry("a", CourseStatus::InProgress, 600, 601).is_complete());
		assert!(entry("a", CourseStatus::Completed, 600, 0).is_complete());
		assert!(!entry("a", CourseStatus::InProgress, 600, 599).is_complete());
		assert!(!entry("a", CourseStatus::NotStarted, 0, 0).is_complete());
	}

	#[test]
	fn next_course_prefers_in_progress() {
		let snapshot = vec![
			entry("a", CourseStatus::Completed, 600, 600),
			entry("b", CourseStatus::NotStarted, 600, 0),
			entry("c", CourseStatus::InProgress, 600, 120),
		];
		assert_eq!(next_course(&snapshot).unwrap().resource_id, "c");
	}

	#[test]
	fn next_course_falls_back_to_first_incomplete() {
		let snapshot = vec![
			entry("a", CourseStatus::Completed, 600, 600),
			entry("b", CourseStatus::NotStarted, 600, 0),
			entry("c", CourseStatus::NotStarted, 600, 0),
		];
		assert_eq!(next_course(&snapshot).unwrap().resource_id, "b");
	}

	#[test]
	fn next_course_none_when_all_done() {
		let snapshot = vec![entry("a", CourseStatus::Completed, 600, 600), entry("b", CourseStatus::Completed, 300, 300)];
		assert!(next_course(&snapshot).is_none());
	}

	#[test]
	fn switch_edge_only_on_zero_after_nonzero() {
		assert!(course_switched(Some(120), 0));
		assert!(!course_switched(Some(0), 0));
		assert!(!course_switched(Some(120), 121));
		assert!(!course_switched(None, 0));
	}

	#[test]
	fn duration_round_trip() {
		assert_eq!(format_duration(3661), "01:01:01");
		assert_eq!(format_duration(0), "00:00:00");
		assert_eq!(parse_duration("01:01:01"), 3661);
		assert_eq!(parse_duration("02:30"), 150);
		assert_eq!(parse_duration(""), 0);
	}

	#[test]
	fn feedback_classification() {
		assert_eq!(LoginFeedback::classify("登录成功"), LoginFeedback::Success);
		assert_eq!(LoginFeedback::classify("没有用户"), LoginFeedback::UserNotFound);
		assert_eq!(LoginFeedback::classify("密码错误"), LoginFeedback::WrongPassword);
		assert_eq!(LoginFeedback::classify("验证码错误"), LoginFeedback::WrongCaptcha);
		assert_eq!(LoginFeedback::classify(""), LoginFeedback::Unknown);
		assert_eq!(LoginFeedback::classify("  登录成功  "), LoginFeedback::Success);
	}
}
