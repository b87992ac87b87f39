//! Automation Driver - one-shot login and navigation to the course page.

use std::time::Duration;

use chromiumoxide::Page;
use color_eyre::{
	Result,
	eyre::{bail, eyre},
};
use rand::Rng;
use tokio::sync::mpsc;
use v_utils::{elog, log};

use crate::{
	LoginFeedback, config::Settings, events::{Credentials, UiSink}, page,
};

pub const LOGIN_URL: &str = "http://www.sczjrcfw.cn/member/index/login?url=";
pub const FEEDBACK_URL: &str = "http://www.sczjrcfw.cn/member/MemberLogin";
pub const SUCCESS_URL: &str = "http://www.sczjrcfw.cn/member/index";
pub const STUDENT_CENTER_URL: &str = "https://scbdystudent.etledu.com/PersonalCenter/StudentIndex?type=1";

/// 3-7 s jitter between scripted clicks, intended to look human
pub fn random_delay() -> Duration {
	Duration::from_millis(rand::rng().random_range(3000..7000))
}

/// Run the login loop until Success or the attempt bound is hit.
///
/// Each round: fresh CAPTCHA pushed to the UI, credentials awaited from the
/// command channel, form submitted, server feedback classified. Every
/// non-Success classification loops back to a new CAPTCHA.
pub async fn run_login(page: &Page, ui: &UiSink, credentials: &mut mpsc::UnboundedReceiver<Credentials>, settings: &Settings) -> Result<()> {
	let mut attempts = 0u32;
	loop {
		attempts += 1;
		page.goto(LOGIN_URL).await.map_err(|e| eyre!("Failed to open login page: {}", e))?;
		tokio::time::sleep(Duration::from_secs(2)).await;
		ui.log("正在获取验证码...");

		let captcha = match page::captcha_image(page).await {
			Ok(img) => img,
			Err(e) => {
				// Structural mismatch: this is the one path that gives up and
				// asks the user to intervene manually.
				elog!("CAPTCHA capture failed: {e}");
				ui.log("未能找到验证码图片，网站可能修改HTML结构或网站未正常打开，请退出程序重新打开。");
				return Err(e);
			}
		};
		ui.captcha(captcha);
		ui.log("请输入注册手机号、密码和图形验证码。");

		let creds = credentials.recv().await.ok_or_else(|| eyre!("Credential channel closed before login completed"))?;
		submit_login_form(page, &creds).await?;
		ui.log("正在登录...");

		let feedback = read_feedback(page).await?;
		ui.log(feedback.message());
		if feedback == LoginFeedback::Success {
			ui.send_enabled(false);
			return Ok(());
		}

		if settings.max_login_attempts > 0 && attempts >= settings.max_login_attempts {
			bail!("Login failed after {} attempts, giving up", attempts);
		}
	}
}

/// Fill the three login fields and click the submit button
async fn submit_login_form(page: &Page, creds: &Credentials) -> Result<()> {
	let fill_script = format!(
		r#"
		(function() {{
			const user = document.querySelector('#login_user');
			const pass = document.querySelector('#login_pass');
			const captcha = document.querySelector('#captcha');
			if (!user || !pass || !captcha) return false;
			user.value = "{}";
			pass.value = "{}";
			captcha.value = "{}";
			return true;
		}})()
		"#,
		page::escape_js(&creds.phone),
		page::escape_js(&creds.password),
		page::escape_js(&creds.captcha)
	);
	let result = page.evaluate(fill_script).await.map_err(|e| eyre!("Failed to fill login form: {}", e))?;
	if result.value().and_then(|v| v.as_bool()) != Some(true) {
		bail!("Login form fields not found");
	}
	page::click(page, "button.btn.btn-primary").await?;
	Ok(())
}

/// Wait for the feedback page, read and classify the server's verdict.
/// Landing on the member index also counts as Success even without the text.
async fn read_feedback(page: &Page) -> Result<LoginFeedback> {
	if let Err(e) = page::wait_for_url(page, FEEDBACK_URL, Duration::from_secs(10)).await {
		tracing::debug!("feedback page did not load: {e}");
	}

	let text_result = page
		.evaluate(
			r#"
			(function() {
				const el = document.querySelector('p.success');
				return el ? el.textContent.trim() : '';
			})()
			"#,
		)
		.await
		.map_err(|e| eyre!("Failed to read login feedback: {}", e))?;
	let feedback_text = text_result.value().and_then(|v| v.as_str()).unwrap_or("").to_string();

	// The feedback page carries a jump link back to the member index
	if page::click(page, "#href").await.is_ok() {
		tokio::time::sleep(Duration::from_secs(1)).await;
	}

	let feedback = LoginFeedback::classify(&feedback_text);
	if feedback == LoginFeedback::Success {
		return Ok(feedback);
	}
	let current_url = page.url().await.map_err(|e| eyre!("Failed to get URL: {}", e))?.unwrap_or_default();
	if current_url == SUCCESS_URL {
		return Ok(LoginFeedback::Success);
	}
	Ok(feedback)
}

/// Click through the fixed chain from the member index to the course page.
/// Each step is preceded by a 3-7 s jitter.
pub async fn navigate_to_courses(page: &Page, ui: &UiSink) -> Result<()> {
	tokio::time::sleep(random_delay()).await;
	ui.log("正在点击\"我的继续教育\"...");
	page::click(page, "#MENU_CONTINUE_EDU").await?;

	ui.log("等待页面跳转到学员中心...");
	page::wait_for_url(page, STUDENT_CENTER_URL, Duration::from_secs(30)).await?;

	tokio::time::sleep(random_delay()).await;
	ui.log("正在关闭小程序弹窗...");
	page::click(page, ".layui-layer-setwin .layui-layer-ico.layui-layer-close1").await?;

	tokio::time::sleep(random_delay()).await;
	ui.log("正在点击\"我的学习\"...");
	page::click(page, r#"a[target="/PersonalCenter/MyTrain"]"#).await?;

	tokio::time::sleep(random_delay()).await;
	ui.log("正在点击\"开始学习\"...");
	page::click(page, "div.layui-btn.layui-btn-sm.layui-btn-normal.blue").await?;

	tokio::time::sleep(random_delay()).await;
	ui.log("正在点击\"我知道了\"按钮...");
	page::click(page, "div.iknow").await?;

	log!("Navigation chain complete, course page reached");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn jitter_stays_in_human_range() {
		for _ in 0..100 {
			let d = random_delay();
			assert!(d >= Duration::from_secs(3));
			assert!(d < Duration::from_secs(7));
		}
	}
}
