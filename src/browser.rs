use anyhow::{Context, Result};
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::ScreenshotParams;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::{Duration, sleep};

use crate::classify::{SCAN_MAX_DEPTH, STRUCTURAL_SELECTORS};
use crate::config::Config;
use crate::dom::{ClickTarget, ElementSnapshot, ScanResult, TitleProbe, VideoState};
use crate::reveal::SavedAttrs;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("page evaluation failed: {0}")]
    EvalFailed(String),

    #[error("screenshot failed: {0}")]
    ScreenshotFailed(String),
}

/// The page bootstrap. Installed before navigation so every document in the
/// target origin gets the `__sj` namespace exactly once.
const BOOTSTRAP_JS: &str = include_str!("inject.js");

/// Chromium session attached to the media-player page. Owns the browser
/// process; dropping it kills Chromium.
pub struct PlayerBrowser {
    _browser: Browser,
    _profile_dir: tempfile::TempDir,
    page: Page,
}

impl PlayerBrowser {
    pub async fn launch(config: &Config) -> Result<Self> {
        // Fresh temp profile each launch so no cookies/state persist between runs
        let user_data_dir = tempfile::tempdir().context("failed to create temp profile dir")?;

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1920, 1080)
            .viewport(Viewport {
                width: 1920,
                height: 1080,
                device_scale_factor: Some(1.0),
                ..Default::default()
            })
            .arg("--disable-dev-shm-usage")
            .arg("--force-device-scale-factor=1")
            .arg("--autoplay-policy=no-user-gesture-required")
            .user_data_dir(user_data_dir.path());

        if config.headless {
            // New headless mode; .with_head() keeps chromiumoxide from adding
            // the legacy --headless flag, then we add --headless=new ourselves.
            builder = builder.with_head().arg("--headless=new");
        } else {
            builder = builder.with_head();
        }

        if let Some(ref path) = config.chromium_path {
            builder = builder.chrome_executable(path);
        }

        let browser_config = builder
            .build()
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;

        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
            "Object.defineProperty(navigator, 'webdriver', { get: () => false });".to_string(),
        ))
        .await
        .context("failed to inject webdriver override")?;

        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
            BOOTSTRAP_JS.to_string(),
        ))
        .await
        .context("failed to inject bootstrap")?;

        tracing::info!("navigating to {}", config.player_url);
        page.goto(config.player_url.as_str())
            .await
            .context("failed to navigate to player page")?;
        sleep(Duration::from_secs(2)).await;

        // Belt and braces for the current document; the bootstrap's own
        // guard makes a second evaluation a no-op.
        page.evaluate(BOOTSTRAP_JS).await.ok();

        Ok(PlayerBrowser {
            _browser: browser,
            _profile_dir: user_data_dir,
            page,
        })
    }

    async fn eval_value<T: DeserializeOwned>(&self, js: String) -> Result<T> {
        let result = self
            .page
            .evaluate(js)
            .await
            .map_err(|e| BrowserError::EvalFailed(e.to_string()))?;
        result
            .into_value::<T>()
            .map_err(|e| BrowserError::EvalFailed(e.to_string()).into())
    }

    /// One classification pass worth of raw DOM facts. Rebuilds the
    /// page-side registry; indices from earlier scans are dead after this.
    pub async fn scan(&self) -> Result<ScanResult> {
        let selectors =
            serde_json::to_string(STRUCTURAL_SELECTORS).context("selector serialization")?;
        let js = format!(
            r#"window.__sj
                ? window.__sj.scan({selectors}, {SCAN_MAX_DEPTH})
                : {{ viewport: {{ width: 0, height: 0 }}, mutations: 0, player_context: false, candidates: [] }}"#,
        );
        self.eval_value(js).await.context("scan probe failed")
    }

    /// DOM mutation counter; cheap enough to poll between full scans.
    pub async fn mutation_count(&self) -> Result<u64> {
        self.eval_value("window.__sj ? window.__sj.mutationCount() : 0".to_string())
            .await
            .context("mutation probe failed")
    }

    /// The shared current-video lookup used by the classifier and the timer.
    pub async fn video_state(&self) -> Result<VideoState> {
        let js = r#"window.__sj
            ? window.__sj.video()
            : { present: false, paused: true, ended: false, ready_state: 0,
                current_time: 0, duration: 0, volume: 0, muted: false }"#;
        self.eval_value(js.to_string()).await.context("video probe failed")
    }

    pub async fn title_probe(&self) -> Result<TitleProbe> {
        let js = r#"window.__sj
            ? window.__sj.title()
            : { metadata_title: null, document_title: (document.title || '') }"#;
        self.eval_value(js.to_string()).await.context("title probe failed")
    }

    /// Dispatch the simulated pointer sequence on a resolved target.
    pub async fn click(&self, index: usize, target: ClickTarget) -> Result<bool> {
        let (which, hop) = match target {
            ClickTarget::Own => ("own", 0),
            ClickTarget::Ancestor(i) => ("ancestor", i),
            ClickTarget::Descendant(i) => ("descendant", i),
        };
        let js = format!("window.__sj ? window.__sj.click({index}, '{which}', {hop}) : false");
        self.eval_value(js).await.context("click dispatch failed")
    }

    /// Force-reveal a hidden candidate. Returns the recorded original
    /// attributes (container, button, parent) or `None` when the element
    /// vanished.
    pub async fn reveal(&self, index: usize) -> Result<Option<Vec<SavedAttrs>>> {
        let js = format!("window.__sj ? window.__sj.reveal({index}) : null");
        self.eval_value(js).await.context("reveal failed")
    }

    /// Fresh snapshot of a registered candidate after styles settled.
    pub async fn snapshot(&self, index: usize) -> Result<Option<ElementSnapshot>> {
        let js = format!("window.__sj ? window.__sj.snapshot({index}) : null");
        self.eval_value(js).await.context("snapshot failed")
    }

    /// Put back the attributes a reveal touched, verbatim.
    pub async fn restore(&self, index: usize, saved: &[SavedAttrs]) -> Result<bool> {
        let payload = serde_json::to_string(saved).context("restore serialization")?;
        let js = format!("window.__sj ? window.__sj.restore({index}, {payload}) : false");
        self.eval_value(js).await.context("restore failed")
    }

    pub async fn set_volume(&self, volume: f64) -> Result<bool> {
        let v = volume.clamp(0.0, 1.0);
        let js = format!("window.__sj ? window.__sj.setVolume({v}) : false");
        self.eval_value(js).await.context("set volume failed")
    }

    pub async fn set_muted(&self, muted: bool) -> Result<bool> {
        let js = format!("window.__sj ? window.__sj.setMuted({muted}) : false");
        self.eval_value(js).await.context("set muted failed")
    }

    pub async fn pause_video(&self) -> Result<bool> {
        self.eval_value("window.__sj ? window.__sj.pauseVideo() : false".to_string())
            .await
            .context("pause failed")
    }

    pub async fn play_chime(&self, volume_pct: u8) -> Result<bool> {
        let js = format!("window.__sj ? window.__sj.chime({volume_pct}) : false");
        self.eval_value(js).await.context("chime failed")
    }

    pub async fn set_dim(&self, on: bool) -> Result<bool> {
        let js = format!("window.__sj ? window.__sj.dim({on}) : false");
        self.eval_value(js).await.context("dim failed")
    }

    pub async fn take_screenshot(&self) -> Result<Vec<u8>> {
        let screenshot = self
            .page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .build(),
            )
            .await
            .map_err(|e| BrowserError::ScreenshotFailed(e.to_string()))?;

        Ok(screenshot)
    }
}
