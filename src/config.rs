use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::eyre};
use serde::{Deserialize, Serialize};
#[cfg(feature = "xdg")]
use v_utils::xdg_state_dir;

/// Flat settings record. Read once at startup, overwritten wholesale on each
/// save; no schema versioning.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
	/// Chrome/Chromium executable to drive; `None` lets chromiumoxide autodetect
	pub browser_path: Option<PathBuf>,
	pub phone: String,
	pub password: String,
	/// Tick interval for both polling loops (default 1000 ms). The page offers
	/// no event hooks, so 1 Hz polling is inherent; this only exists so tests
	/// and slow machines can stretch it.
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
	/// Max login attempts before giving up (0 = retry forever, the original behavior)
	#[serde(default = "default_max_login_attempts")]
	pub max_login_attempts: u32,
	/// Max QR-guardian self-restarts after unexpected failures
	#[serde(default = "default_max_guardian_restarts")]
	pub max_guardian_restarts: u32,
	/// Run with visible browser window (non-headless mode)
	#[serde(default)]
	pub visible: bool,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			browser_path: None,
			phone: String::new(),
			password: String::new(),
			poll_interval_ms: default_poll_interval_ms(),
			max_login_attempts: default_max_login_attempts(),
			max_guardian_restarts: default_max_guardian_restarts(),
			visible: false,
		}
	}
}

fn default_poll_interval_ms() -> u64 {
	1000
}

fn default_max_login_attempts() -> u32 {
	10
}

fn default_max_guardian_restarts() -> u32 {
	5
}

impl Settings {
	#[cfg(feature = "xdg")]
	pub fn default_path() -> PathBuf {
		xdg_state_dir!("config").join("settings.json")
	}

	/// Load settings from the fixed location; a missing file yields defaults.
	#[cfg(feature = "xdg")]
	pub fn load() -> Result<Self> {
		Self::load_from(&Self::default_path())
	}

	/// Persist the whole record to the fixed location.
	#[cfg(feature = "xdg")]
	pub fn save(&self) -> Result<()> {
		self.save_to(&Self::default_path())
	}

	pub fn load_from(path: &Path) -> Result<Self> {
		if !path.exists() {
			tracing::info!(?path, "settings file not found, using defaults");
			return Ok(Self::default());
		}
		let content = std::fs::read_to_string(path).map_err(|e| eyre!("Failed to read settings file {}: {}", path.display(), e))?;
		serde_json::from_str(&content).map_err(|e| eyre!("Failed to parse settings file {}: {}", path.display(), e))
	}

	pub fn save_to(&self, path: &Path) -> Result<()> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).map_err(|e| eyre!("Failed to create settings dir: {}", e))?;
		}
		let content = serde_json::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize settings: {}", e))?;
		std::fs::write(path, content).map_err(|e| eyre!("Failed to write settings file {}: {}", path.display(), e))?;
		Ok(())
	}

	pub fn poll_interval(&self) -> std::time::Duration {
		std::time::Duration::from_millis(self.poll_interval_ms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn temp_settings_path(tag: &str) -> PathBuf {
		std::env::temp_dir().join(format!("cedu_settings_{}_{}.json", tag, std::process::id()))
	}

	#[test]
	fn save_load_round_trip() {
		let path = temp_settings_path("roundtrip");
		let settings = Settings {
			browser_path: Some(PathBuf::from("C:\\chrome.exe")),
			phone: "13800000000".to_string(),
			password: "x".to_string(),
			..Settings::default()
		};
		settings.save_to(&path).unwrap();
		let loaded = Settings::load_from(&path).unwrap();
		std::fs::remove_file(&path).ok();

		assert_eq!(loaded.browser_path, Some(PathBuf::from("C:\\chrome.exe")));
		assert_eq!(loaded.phone, "13800000000");
		assert_eq!(loaded.password, "x");
		assert_eq!(loaded.poll_interval_ms, 1000);
	}

	#[test]
	fn save_overwrites_wholesale() {
		let path = temp_settings_path("overwrite");
		let first = Settings { phone: "111".to_string(), ..Settings::default() };
		first.save_to(&path).unwrap();
		let second = Settings { password: "secret".to_string(), ..Settings::default() };
		second.save_to(&path).unwrap();
		let loaded = Settings::load_from(&path).unwrap();
		std::fs::remove_file(&path).ok();

		// The first record is gone entirely, not merged
		assert_eq!(loaded.phone, "");
		assert_eq!(loaded.password, "secret");
	}

	#[test]
	fn missing_file_yields_defaults() {
		let loaded = Settings::load_from(Path::new("/nonexistent/cedu_settings.json")).unwrap();
		assert_eq!(loaded.phone, "");
		assert_eq!(loaded.max_login_attempts, 10);
		assert_eq!(loaded.max_guardian_restarts, 5);
		assert!(!loaded.visible);
	}
}
