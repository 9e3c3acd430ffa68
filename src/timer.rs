use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};

use crate::state::AppState;

/// Hard ceiling for the countdown.
pub const TIMER_MAX_SECS: f64 = 12.0 * 3600.0;

/// Remaining time at or below this is "zero" (float dust from wall-clock
/// deltas).
const ZERO_EPS: f64 = 0.01;

/// What happens to the video when the countdown reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerEndAction {
    Pause,
    Mute,
    Reduce,
}

/// Volume fade applied over the last stretch of the countdown.
#[derive(Debug, Clone, Copy)]
pub struct FadeWindow {
    pub seconds: f64,
}

/// Outcome of one coordinator tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tick {
    /// No timer armed.
    Idle,
    /// Running but not decrementing (media paused/ended, or user-paused).
    Suspended,
    /// Decremented; `fade_to` carries a volume to apply when fading.
    Running { fade_to: Option<f64> },
    /// Crossed zero this tick; end actions are due.
    Finished,
}

/// Sleep-timer state. Owned by the coordinator task; mutated only by its
/// tick and by explicit user actions routed through the control API.
/// Idle → (add/set > 0) → Running → (zero or cancel) → Idle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimerState {
    pub remaining_secs: f64,
    pub total_secs: f64,
    pub running: bool,
    pub user_paused: bool,
    pub suspended: bool,
    pub fade_active: bool,
    #[serde(skip)]
    fade_start_volume: f64,
}

impl TimerState {
    pub fn is_idle(&self) -> bool {
        !self.running
    }

    /// Add a signed delta to the remaining time, clamped to [0, 12 h].
    /// Lands at zero → cancel. Starting from idle arms the timer. A
    /// user-paused timer stays paused when time is added.
    pub fn add_seconds(&mut self, delta: f64) {
        let was_running = self.running;
        let next = (self.remaining_secs + delta).clamp(0.0, TIMER_MAX_SECS);

        if next <= ZERO_EPS {
            self.cancel();
            return;
        }

        self.remaining_secs = next;
        self.running = true;
        self.fade_active = false;

        if !was_running || self.total_secs <= 0.0 {
            self.total_secs = next;
        } else {
            let t = (self.total_secs + delta).clamp(1.0, TIMER_MAX_SECS);
            self.total_secs = t.max(next);
        }
    }

    /// Set the remaining time outright; ≤ 0 is equivalent to cancel.
    /// Clears user-pause and suspension.
    pub fn set_absolute(&mut self, secs: f64) {
        let s = secs.clamp(0.0, TIMER_MAX_SECS);
        if s <= ZERO_EPS {
            self.cancel();
            return;
        }
        self.remaining_secs = s;
        self.total_secs = s;
        self.running = true;
        self.user_paused = false;
        self.suspended = false;
        self.fade_active = false;
    }

    pub fn cancel(&mut self) {
        *self = TimerState::default();
    }

    pub fn toggle_user_pause(&mut self) {
        if !self.running {
            return;
        }
        self.user_paused = !self.user_paused;
    }

    /// Advance by `dt` seconds of wall-clock time. Decrements only while
    /// running and the media is actually playing and the user has not paused
    /// the timer; a fixed per-tick decrement would drift in throttled
    /// background contexts, the wall-clock delta does not.
    pub fn tick(
        &mut self,
        dt: f64,
        playing: bool,
        fade: Option<FadeWindow>,
        current_volume: f64,
    ) -> Tick {
        if !self.running || self.remaining_secs <= 0.0 {
            return Tick::Idle;
        }

        if self.user_paused || !playing {
            self.suspended = true;
            return Tick::Suspended;
        }
        self.suspended = false;

        self.remaining_secs = (self.remaining_secs - dt.max(0.0)).max(0.0);

        let fade_to = fade.and_then(|w| self.fade_volume(w, current_volume));

        if self.remaining_secs <= ZERO_EPS {
            let _ = std::mem::take(self);
            return Tick::Finished;
        }
        Tick::Running { fade_to }
    }

    /// Linear ramp from the volume at fade start down toward zero over the
    /// fade window.
    fn fade_volume(&mut self, window: FadeWindow, current_volume: f64) -> Option<f64> {
        if window.seconds <= 0.0 || self.remaining_secs > window.seconds {
            return None;
        }
        if !self.fade_active {
            self.fade_active = true;
            self.fade_start_volume = current_volume;
        }
        let p = 1.0 - self.remaining_secs / window.seconds;
        Some((self.fade_start_volume * (1.0 - p)).clamp(0.0, 1.0))
    }
}

/// Timer coordinator: fixed small tick, wall-clock deltas, end actions.
/// Runs for the life of the process and no-ops while no browser is attached.
pub async fn run_timer(state: AppState) {
    let mut last = Instant::now();

    loop {
        let tick_ms = {
            let s = state.lock().await;
            s.settings.timer_tick_ms
        };
        sleep(Duration::from_millis(tick_ms.max(50))).await;

        let now = Instant::now();
        let dt = now.duration_since(last).as_secs_f64();
        last = now;

        let (browser, settings) = {
            let s = state.lock().await;
            (s.browser.clone(), s.settings.clone())
        };
        let Some(browser) = browser else { continue };

        let video = match browser.video_state().await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("video probe failed: {e:#}");
                continue;
            }
        };

        let fade = settings
            .fade_before_end
            .then(|| FadeWindow {
                seconds: settings.fade_seconds.clamp(3.0, 180.0),
            });

        let outcome = {
            let mut s = state.lock().await;
            s.timer.tick(dt, video.is_playing(), fade, video.volume)
        };

        match outcome {
            Tick::Idle | Tick::Suspended => {}
            Tick::Running { fade_to } => {
                if let Some(v) = fade_to
                    && let Err(e) = browser.set_volume(v).await
                {
                    tracing::warn!("fade volume failed: {e:#}");
                }
            }
            Tick::Finished => {
                tracing::info!("sleep timer finished, applying end action");
                apply_end_action(&state, &browser, &settings, &video).await;
            }
        }
    }
}

async fn apply_end_action(
    state: &AppState,
    browser: &Arc<crate::browser::PlayerBrowser>,
    settings: &crate::settings::Settings,
    video: &crate::dom::VideoState,
) {
    if !video.present {
        return;
    }

    match settings.timer_end_action {
        TimerEndAction::Reduce => {
            // Keep playing at a whisper; remember what to restore.
            {
                let mut s = state.lock().await;
                s.pre_end_volume = Some((video.volume, video.muted));
            }
            let target = f64::from(settings.reduce_audio_level_pct.min(100)) / 100.0;
            browser.set_muted(false).await.ok();
            if let Err(e) = browser.set_volume(target).await {
                tracing::warn!("reduce volume failed: {e:#}");
            }
        }
        TimerEndAction::Mute => {
            if let Err(e) = browser.set_muted(true).await {
                tracing::warn!("mute failed: {e:#}");
            }
        }
        TimerEndAction::Pause => {
            if let Err(e) = browser.pause_video().await {
                tracing::warn!("pause failed: {e:#}");
            }
        }
    }

    if settings.timer_end_chime {
        browser
            .play_chime(settings.timer_end_chime_volume_pct)
            .await
            .ok();
    }
    if settings.dim_screen {
        browser.set_dim(true).await.ok();
    }
}
