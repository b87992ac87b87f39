//! Page Inspector - all DOM reads and clicks against the course portal.
//!
//! Every read is derived from the live page at call time; nothing is cached
//! here. The selectors mirror the portal's markup and are load-bearing: any
//! markup change on the site breaks them.

use std::time::Duration;

use base64::Engine;
use chromiumoxide::{Page, cdp::browser_protocol::page::CaptureScreenshotFormat};
use color_eyre::{Result, eyre::eyre};
use serde::Deserialize;
use v_utils::elog;

use crate::{CourseEntry, CourseStatus};

/// Container item for one course on the course page
pub const COURSE_ITEM_SELECTOR: &str = ".video_list .kecheng_li";
/// The face-verification QR image the portal injects periodically
pub const QR_IMAGE_SELECTOR: &str = "#faceQRCode";
/// Reload control next to an expired QR code
pub const QR_RELOAD_SELECTOR: &str = "#btnReloadQRCode";
/// Countdown label inside the challenge popup
pub const QR_COUNTDOWN_SELECTOR: &str = ".heartCheckTimer";
/// CAPTCHA image on the login form
pub const CAPTCHA_SELECTOR: &str = r#"img[alt="captcha"]"#;

/// One course item as the page reports it, before status derivation
#[derive(Debug, Deserialize)]
struct RawCourseItem {
	resource_id: String,
	name: String,
	label: Option<String>,
	total: u64,
	watched: u64,
}

fn entry_from_raw(raw: RawCourseItem) -> CourseEntry {
	let status = CourseStatus::derive(raw.label.as_deref(), raw.watched, raw.total);
	CourseEntry {
		resource_id: raw.resource_id,
		name: raw.name,
		status,
		total_seconds: raw.total,
		watched_seconds: raw.watched,
	}
}

fn parse_snapshot_json(json: &str) -> Result<Vec<CourseEntry>> {
	let raw: Vec<RawCourseItem> = serde_json::from_str(json).map_err(|e| eyre!("Failed to parse course list JSON: {}", e))?;
	Ok(raw.into_iter().map(entry_from_raw).collect())
}

/// Wait up to `timeout` for the course-list container to be attached.
/// Returns false on timeout; the caller treats that as "temporarily unavailable".
pub async fn wait_for_course_list(page: &Page, timeout: Duration) -> bool {
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		if page.find_element(COURSE_ITEM_SELECTOR).await.is_ok() {
			return true;
		}
		if tokio::time::Instant::now() >= deadline {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(500)).await;
	}
}

/// Read the full course list. An absent container (after a bounded 10 s wait)
/// yields an empty list, not an error - the page may be mid-navigation.
pub async fn snapshot(page: &Page) -> Result<Vec<CourseEntry>> {
	if !wait_for_course_list(page, Duration::from_secs(10)).await {
		elog!("课件列表未找到，可能页面尚未加载完成。");
		return Ok(Vec::new());
	}

	let script = format!(
		r#"
		(function() {{
			const lis = Array.from(document.querySelectorAll('{COURSE_ITEM_SELECTOR}'));
			const items = lis.map(li => {{
				const finishSpan = li.querySelector('.bofang_list_name_wanchengdu');
				const nameDiv = li.querySelector('.bofang_list_name_title');
				return {{
					resource_id: li.getAttribute('data-resourceid') || '',
					name: nameDiv ? nameDiv.textContent.trim() : '',
					label: finishSpan ? finishSpan.textContent.trim() : null,
					total: Number(li.getAttribute('data-totalcount')) || 0,
					watched: Number(li.getAttribute('data-secondslearned')) || 0
				}};
			}});
			return JSON.stringify(items);
		}})()
		"#
	);

	let result = page.evaluate(script).await.map_err(|e| eyre!("Failed to read course list: {}", e))?;
	let json_str = result.value().and_then(|v| v.as_str()).unwrap_or("[]");
	parse_snapshot_json(json_str)
}

/// Quote a value for embedding inside a JS string literal
pub(crate) fn escape_js(value: &str) -> String {
	value.replace('\\', "\\\\").replace('"', "\\\"").replace('\'', "\\'").replace('\n', "\\n")
}

/// Read the watched/total counters of one course item by resource id.
/// Returns `None` if the item is currently absent from the DOM.
pub async fn read_progress(page: &Page, resource_id: &str) -> Result<Option<CourseEntry>> {
	let resource_id = escape_js(resource_id);
	let script = format!(
		r#"
		(function() {{
			const li = document.querySelector('{COURSE_ITEM_SELECTOR}[data-resourceid="{resource_id}"]');
			if (!li) return null;
			const finishSpan = li.querySelector('.bofang_list_name_wanchengdu');
			const nameDiv = li.querySelector('.bofang_list_name_title');
			return JSON.stringify({{
				resource_id: '{resource_id}',
				name: nameDiv ? nameDiv.textContent.trim() : '',
				label: finishSpan ? finishSpan.textContent.trim() : null,
				total: Number(li.getAttribute('data-totalcount')) || 0,
				watched: Number(li.getAttribute('data-secondslearned')) || 0
			}});
		}})()
		"#
	);

	let result = page.evaluate(script).await.map_err(|e| eyre!("Failed to read course progress: {}", e))?;
	let Some(json_str) = result.value().and_then(|v| v.as_str()) else {
		return Ok(None);
	};
	let raw: RawCourseItem = serde_json::from_str(json_str).map_err(|e| eyre!("Failed to parse course progress JSON: {}", e))?;
	Ok(Some(entry_from_raw(raw)))
}

/// Screenshot the login CAPTCHA image and return it base64-encoded.
/// A permanently absent CAPTCHA is the one structural error that aborts login.
pub async fn captcha_image(page: &Page) -> Result<String> {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
	let element = loop {
		match page.find_element(CAPTCHA_SELECTOR).await {
			Ok(el) => break el,
			Err(_) if tokio::time::Instant::now() < deadline => tokio::time::sleep(Duration::from_millis(500)).await,
			Err(e) => return Err(eyre!("CAPTCHA image not found: {}", e)),
		}
	};
	let bytes = element.screenshot(CaptureScreenshotFormat::Png).await.map_err(|e| eyre!("Failed to screenshot CAPTCHA: {}", e))?;
	Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Whether the face-verification challenge popup is currently visible
pub async fn challenge_visible(page: &Page) -> Result<bool> {
	let script = format!(
		r#"
		(function() {{
			const el = document.querySelector('{QR_IMAGE_SELECTOR}');
			if (!el) return false;
			const style = window.getComputedStyle(el);
			return el.offsetParent !== null && style.visibility !== 'hidden' && style.display !== 'none';
		}})()
		"#
	);
	let result = page.evaluate(script).await.map_err(|e| eyre!("Failed to check challenge visibility: {}", e))?;
	Ok(result.value().and_then(|v| v.as_bool()).unwrap_or(false))
}

/// Fetch the challenge QR image. The portal inlines it as a PNG data URL,
/// so this strips the `data:image/png;base64,` prefix.
pub async fn challenge_image(page: &Page) -> Result<String> {
	let element = page.find_element(QR_IMAGE_SELECTOR).await.map_err(|e| eyre!("Challenge image not found: {}", e))?;
	let src = element
		.attribute("src")
		.await
		.map_err(|e| eyre!("Failed to read challenge image src: {}", e))?
		.ok_or_else(|| eyre!("Challenge image has no src attribute"))?;
	Ok(strip_data_url(&src).to_string())
}

fn strip_data_url(src: &str) -> &str {
	match src.split_once("base64,") {
		Some((_, data)) => data,
		None => src,
	}
}

/// Read the challenge countdown label text (e.g. `2分30秒`)
pub async fn countdown_text(page: &Page) -> Result<String> {
	let script = format!(
		r#"
		(function() {{
			const el = document.querySelector('{QR_COUNTDOWN_SELECTOR}');
			return el ? el.textContent.trim() : null;
		}})()
		"#
	);
	let result = page.evaluate(script).await.map_err(|e| eyre!("Failed to read countdown: {}", e))?;
	result
		.value()
		.and_then(|v| v.as_str())
		.map(|s| s.to_string())
		.ok_or_else(|| eyre!("Countdown label not found"))
}

/// Click the QR reload control to request a fresh code
pub async fn click_reload_qr(page: &Page) -> Result<()> {
	let element = page.find_element(QR_RELOAD_SELECTOR).await.map_err(|e| eyre!("QR reload control not found: {}", e))?;
	element.click().await.map_err(|e| eyre!("Failed to click QR reload: {}", e))?;
	Ok(())
}

/// Click an arbitrary element by selector
pub async fn click(page: &Page, selector: &str) -> Result<()> {
	let element = page.find_element(selector).await.map_err(|e| eyre!("Element {} not found: {}", selector, e))?;
	element.click().await.map_err(|e| eyre!("Failed to click {}: {}", selector, e))?;
	Ok(())
}

/// Wait until the page URL starts with `prefix`, polling every 500 ms up to `timeout`
pub async fn wait_for_url(page: &Page, prefix: &str, timeout: Duration) -> Result<String> {
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		let current = page.url().await.map_err(|e| eyre!("Failed to get URL: {}", e))?.unwrap_or_default();
		if current.starts_with(prefix) {
			return Ok(current);
		}
		if tokio::time::Instant::now() >= deadline {
			return Err(eyre!("Timed out waiting for URL {}, still at {}", prefix, current));
		}
		tokio::time::sleep(Duration::from_millis(500)).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn snapshot_json_derives_status_per_item() {
		let json = r#"[
			{"resource_id": "r1", "name": "安全生产", "label": "已学完", "total": 600, "watched": 600},
			{"resource_id": "r2", "name": "施工管理", "label": "学习中", "total": 900, "watched": 120},
			{"resource_id": "r3", "name": "法律法规", "label": null, "total": 300, "watched": 0}
		]"#;
		let entries = parse_snapshot_json(json).unwrap();
		assert_eq!(entries.len(), 3);
		assert_eq!(entries[0].status, CourseStatus::Completed);
		assert_eq!(entries[1].status, CourseStatus::InProgress);
		assert_eq!(entries[1].watched_seconds, 120);
		assert_eq!(entries[2].status, CourseStatus::NotStarted);
		assert_eq!(entries[2].name, "法律法规");
	}

	#[test]
	fn snapshot_json_counters_decide_when_label_missing() {
		let json = r#"[{"resource_id": "r1", "name": "x", "label": null, "total": 600, "watched": 600}]"#;
		let entries = parse_snapshot_json(json).unwrap();
		assert_eq!(entries[0].status, CourseStatus::Completed);
	}

	#[test]
	fn snapshot_json_rejects_garbage() {
		assert!(parse_snapshot_json("not json").is_err());
	}

	#[test]
	fn js_escaping_keeps_injected_values_inert() {
		assert_eq!(escape_js("13800000000"), "13800000000");
		assert_eq!(escape_js(r#"pass"word"#), r#"pass\"word"#);
		assert_eq!(escape_js(r"back\slash"), r"back\\slash");
		assert_eq!(escape_js("it's"), r"it\'s");
		// A hostile resource id cannot terminate the selector string
		assert_eq!(escape_js(r#"r1"]'); alert(1); ('"#), r#"r1\"]\'); alert(1); (\'"#);
	}

	#[test]
	fn data_url_prefix_stripped() {
		assert_eq!(strip_data_url("data:image/png;base64,iVBORw0KG"), "iVBORw0KG");
		assert_eq!(strip_data_url("data:image/jpeg;base64,/9j/4AAQ"), "/9j/4AAQ");
		// Already-bare payloads pass through untouched
		assert_eq!(strip_data_url("iVBORw0KG"), "iVBORw0KG");
	}
}
