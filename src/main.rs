use std::path::PathBuf;

use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig};
use clap::Parser;
use color_eyre::{
	Result,
	eyre::{bail, eyre},
};
use futures::StreamExt;
use tokio::{
	io::{AsyncBufReadExt, BufReader},
	sync::mpsc,
};

use cedu_headless::{
	config::Settings,
	events::{Credentials, UiEvent, UiSink},
	format_duration,
	session::Session,
};

#[derive(Debug, Parser)]
#[command(name = "cedu_headless")]
#[command(about = "Automated progress tracking for the continuing-education portal", long_about = None)]
struct Args {
	/// Run with visible browser window (non-headless mode)
	#[arg(long)]
	visible: bool,

	/// Registered phone number (falls back to saved settings)
	#[arg(short, long)]
	phone: Option<String>,

	/// Account password (falls back to saved settings)
	#[arg(short = 'P', long)]
	password: Option<String>,

	/// Chrome/Chromium executable to drive
	#[arg(long)]
	browser_path: Option<PathBuf>,

	/// Persist the given phone/password/browser path to the settings file and exit
	#[arg(long)]
	save: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	let args = Args::parse();

	#[cfg(feature = "xdg")]
	let mut settings = Settings::load()?;
	#[cfg(not(feature = "xdg"))]
	let mut settings = Settings::default();

	if let Some(phone) = args.phone {
		settings.phone = phone;
	}
	if let Some(password) = args.password {
		settings.password = password;
	}
	if let Some(path) = args.browser_path {
		settings.browser_path = Some(path);
	}
	if args.visible {
		settings.visible = true;
	}

	if args.save {
		#[cfg(feature = "xdg")]
		{
			settings.save()?;
			println!("Settings saved to {}", Settings::default_path().display());
			return Ok(());
		}
		#[cfg(not(feature = "xdg"))]
		bail!("--save requires the xdg feature");
	}

	if settings.phone.is_empty() || settings.password.is_empty() {
		bail!("phone and password are required (pass --phone/--password or save them with --save)");
	}

	let mut builder = BrowserConfig::builder();
	if settings.visible {
		builder = builder.with_head();
	}
	if let Some(path) = &settings.browser_path {
		builder = builder.chrome_executable(path);
	}
	let browser_config = builder.build().map_err(|e| eyre!("Failed to build browser config: {}", e))?;

	let (mut browser, mut handler) = Browser::launch(browser_config).await.map_err(|e| eyre!("Failed to launch browser: {}", e))?;

	// Drain CDP events so the browser connection doesn't stall
	let handler_task = tokio::spawn(async move {
		while let Some(_event) = handler.next().await {}
	});

	let page = browser.new_page("about:blank").await.map_err(|e| eyre!("Failed to create new page: {}", e))?;

	let (ui, ui_rx) = UiSink::new();
	let (cred_tx, mut cred_rx) = mpsc::unbounded_channel();
	let ui_task = tokio::spawn(consume_ui_events(ui_rx, cred_tx, settings.phone.clone(), settings.password.clone()));

	let session = Session::new(page, ui, settings);
	let loop_handles = session.run(&mut cred_rx).await?;

	println!("自动化已启动，输入 refresh 回车可手动刷新课件列表，Ctrl+C 退出。");
	let mut loops_done = futures::future::join_all(loop_handles);
	let mut commands = BufReader::new(tokio::io::stdin()).lines();
	let mut commands_open = true;
	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => break,
			_ = &mut loops_done => break,
			line = commands.next_line(), if commands_open => match line {
				Ok(Some(cmd)) if cmd.trim() == "refresh" => match session.refresh_course_list().await {
					Ok(message) => println!("{message}"),
					Err(e) => eprintln!("刷新课件列表失败: {e}"),
				},
				Ok(Some(_)) => {}
				// Closed or unreadable stdin must not spin the loop
				_ => commands_open = false,
			},
		}
	}

	browser.close().await.map_err(|e| eyre!("Failed to close browser: {}", e))?;
	handler_task.abort();
	ui_task.abort();

	Ok(())
}

/// Stand-in for the desktop UI: render push events on the terminal, and answer
/// CAPTCHA prompts from stdin using the saved phone/password.
async fn consume_ui_events(mut ui_rx: mpsc::UnboundedReceiver<UiEvent>, cred_tx: mpsc::UnboundedSender<Credentials>, phone: String, password: String) {
	let mut stdin = BufReader::new(tokio::io::stdin()).lines();

	while let Some(event) = ui_rx.recv().await {
		match event {
			UiEvent::Log(line) => println!("{line}"),
			UiEvent::Captcha(data) => {
				match write_image("captcha", &data) {
					Ok(path) => println!("验证码图片: {}", path.display()),
					Err(e) => eprintln!("Failed to write CAPTCHA image: {e}"),
				}
				println!("请输入图形验证码并回车:");
				if let Ok(Some(line)) = stdin.next_line().await {
					let _ = cred_tx.send(Credentials {
						phone: phone.clone(),
						password: password.clone(),
						captcha: line.trim().to_string(),
					});
				}
			}
			UiEvent::CourseList { courses, current_watched_seconds } => {
				println!("课件列表（当前已观看 {} 秒）:", current_watched_seconds);
				for course in &courses {
					println!("  [{:?}] {} ({})", course.status, course.name, course.duration());
				}
			}
			UiEvent::Progress {
				resource_id,
				watched_seconds,
				remain_seconds,
				finish_time,
			} => {
				println!(
					"进度 {}: 已观看 {}，剩余 {}，预计 {} 完成",
					resource_id,
					format_duration(watched_seconds),
					format_duration(remain_seconds),
					finish_time
				);
			}
			UiEvent::QrImage(data) => match write_image("qrcode", &data) {
				Ok(path) => println!("二维码图片: {}", path.display()),
				Err(e) => eprintln!("Failed to write QR image: {e}"),
			},
			UiEvent::QrCountdown(text) => println!("二维码剩余时间: {text}"),
			UiEvent::QrSolved => println!("人脸识别成功。"),
			UiEvent::SendEnabled(enabled) => tracing::debug!("send control enabled: {enabled}"),
			UiEvent::HideWindow => tracing::debug!("UI hide requested"),
		}
	}
}

fn write_image(label: &str, base64_data: &str) -> Result<PathBuf> {
	let bytes = base64::engine::general_purpose::STANDARD.decode(base64_data).map_err(|e| eyre!("Failed to decode image: {}", e))?;
	let path = std::env::temp_dir().join(format!("cedu_{}_{}.png", label, std::process::id()));
	std::fs::write(&path, bytes).map_err(|e| eyre!("Failed to write image file: {}", e))?;
	Ok(path)
}
