use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::{Duration, sleep};

use crate::browser::PlayerBrowser;
use crate::classify::{self, ActionKind, Candidate, PlaybackPhase};
use crate::config::Config;
use crate::dom::{self, ClickTarget, ElementSnapshot, ScanResult, VideoState, Viewport};
use crate::reveal::RevealTicket;
use crate::series::SeriesIdentity;
use crate::settings::{EffectiveRules, Settings};
use crate::state::{ActionRecord, AppState, EnginePhase};

/// Settle delay after a force-reveal, before re-checking visibility.
const REVEAL_SETTLE_MS: u64 = 120;
const REVEAL_LAST_CHANCE_MS: u64 = 80;

/// Gate in front of the click dispatcher: a per-action-family window plus an
/// independent cross-action window over all families.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    per_family: HashMap<ActionKind, Instant>,
    last_any: Option<Instant>,
    family_cooldown: Duration,
    cross_cooldown: Duration,
}

impl CooldownGate {
    pub fn from_settings(settings: &Settings) -> Self {
        CooldownGate {
            per_family: HashMap::new(),
            last_any: None,
            family_cooldown: Duration::from_millis(settings.click_cooldown_ms.clamp(50, 5000)),
            cross_cooldown: Duration::from_millis(settings.min_auto_cooldown_ms.clamp(100, 5000)),
        }
    }

    /// Pick up new cooldown widths without losing the stamps.
    pub fn reconfigure(&mut self, settings: &Settings) {
        self.family_cooldown = Duration::from_millis(settings.click_cooldown_ms.clamp(50, 5000));
        self.cross_cooldown = Duration::from_millis(settings.min_auto_cooldown_ms.clamp(100, 5000));
    }

    /// True when a click for `kind` may fire now; stamps both windows when
    /// it does.
    pub fn try_acquire(&mut self, kind: ActionKind, now: Instant) -> bool {
        if let Some(last) = self.per_family.get(&kind)
            && now.duration_since(*last) < self.family_cooldown
        {
            return false;
        }
        if let Some(last) = self.last_any
            && now.duration_since(last) < self.cross_cooldown
        {
            return false;
        }
        self.per_family.insert(kind, now);
        self.last_any = Some(now);
        true
    }

    #[cfg(test)]
    fn with_windows(family_ms: u64, cross_ms: u64) -> Self {
        CooldownGate {
            per_family: HashMap::new(),
            last_any: None,
            family_cooldown: Duration::from_millis(family_ms),
            cross_cooldown: Duration::from_millis(cross_ms),
        }
    }
}

fn log_action(config: &Config, record: &ActionRecord) {
    use std::fs::OpenOptions;
    use std::io::Write;

    let line = match serde_json::to_string(record) {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!("failed to serialize action record: {e}");
            return;
        }
    };

    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.action_log)
    {
        Ok(mut f) => {
            if let Err(e) = writeln!(f, "{line}") {
                tracing::warn!("failed to write to {}: {e}", config.action_log.display());
            }
        }
        Err(e) => {
            tracing::warn!("failed to open {}: {e}", config.action_log.display());
        }
    }
}

/// Launch the browser and attach to the player page if not already done.
/// Sets phase Idle → Preparing → Ready. Returns the existing browser when
/// one is alive.
pub async fn prepare_browser(state: &AppState) -> Result<Arc<PlayerBrowser>> {
    {
        let s = state.lock().await;
        if let Some(ref browser) = s.browser {
            return Ok(browser.clone());
        }
    }

    let config = {
        let mut s = state.lock().await;
        s.phase = EnginePhase::Preparing;
        s.config.clone()
    };

    tracing::info!("launching browser");
    let browser = Arc::new(
        PlayerBrowser::launch(&config)
            .await
            .context("failed to launch browser")?,
    );

    {
        let mut s = state.lock().await;
        s.browser = Some(browser.clone());
        s.phase = EnginePhase::Ready;
    }

    tracing::info!("browser ready");
    Ok(browser)
}

/// Check whether the automation loop should continue. If paused, blocks
/// until resumed. Returns `true` for Running, `false` for anything else.
async fn check_should_continue(state: &AppState) -> bool {
    loop {
        let (phase, notify) = {
            let s = state.lock().await;
            (s.phase, s.pause_notify.clone())
        };
        match phase {
            EnginePhase::Running => return true,
            EnginePhase::Paused => {
                tracing::info!("automation paused, waiting for resume");
                notify.notified().await;
            }
            _ => return false,
        }
    }
}

/// Carried between passes: lets an idle page (no mutations, no player
/// chrome) skip the full scan probe.
#[derive(Debug, Default)]
struct PassMemory {
    last_mutations: u64,
    last_player_context: bool,
}

pub async fn run_engine(state: AppState) -> Result<()> {
    let browser = prepare_browser(&state).await?;

    {
        let mut s = state.lock().await;
        s.phase = EnginePhase::Running;
    }

    tracing::info!("automation loop started");
    let mut memory = PassMemory::default();

    loop {
        if !check_should_continue(&state).await {
            tracing::info!("automation stopped");
            return Ok(());
        }

        let settings = {
            let mut s = state.lock().await;
            let snap = s.settings.clone();
            s.gate.reconfigure(&snap);
            snap
        };

        sleep(Duration::from_millis(settings.scan_interval_ms.clamp(100, 10_000))).await;

        if let Err(e) = pass(&state, &browser, &settings, &mut memory).await {
            tracing::warn!("automation pass failed: {e:#}");
        }
    }
}

/// One classify → score → reveal → click pass. At most one action fires per
/// pass; transient absence of a matching control is the normal outcome.
async fn pass(
    state: &AppState,
    browser: &Arc<PlayerBrowser>,
    settings: &Arc<Settings>,
    memory: &mut PassMemory,
) -> Result<()> {
    // Refresh show identity opportunistically; a failed probe changes nothing.
    if let Ok(probe) = browser.title_probe().await {
        let identity =
            SeriesIdentity::resolve(probe.metadata_title.as_deref(), &probe.document_title);
        let mut s = state.lock().await;
        if s.update_series(identity) {
            s.persist_local();
        }
    }

    let video = browser.video_state().await.unwrap_or_default();
    let phase = classify::playback_phase(&video, &settings.phase);
    let late = classify::is_late_phase(&video, &settings.phase);

    let (key, title) = {
        let s = state.lock().await;
        (
            s.series.canonical_key.clone(),
            s.series.display_title.clone(),
        )
    };
    let rules = settings.rules_for(&key, &title);

    handle_credits_volume(state, browser, settings, &rules, phase, &video).await;

    if !settings.global_enabled {
        return Ok(());
    }

    // Idle fast path: nothing mutated and the last look found no player
    // chrome, so a rescan would see the same page.
    let mutations = browser.mutation_count().await.unwrap_or(u64::MAX);
    if mutations == memory.last_mutations && !memory.last_player_context && !video.present {
        return Ok(());
    }

    let scan = browser.scan().await.context("scan probe failed")?;
    memory.last_mutations = scan.mutations;
    memory.last_player_context = scan.player_context;

    if !scan.player_context {
        return Ok(());
    }

    for kind in ActionKind::ALL {
        let enabled = match kind {
            ActionKind::Intro => rules.skip_intro,
            ActionKind::Credits => rules.skip_credits,
            ActionKind::Next => rules.next_episode,
        };
        if !enabled {
            continue;
        }
        // Intro/credits only make sense while an episode is up; next keeps
        // working on the post-play screen where the <video> is gone.
        if kind != ActionKind::Next && !video.present {
            continue;
        }

        let kind_late = match kind {
            ActionKind::Intro => false,
            ActionKind::Credits => phase == PlaybackPhase::Credits,
            ActionKind::Next => late,
        };
        let cands = classify::find_candidates(&scan, kind, phase, kind_late);
        if cands.is_empty() {
            continue;
        }

        if attempt_action(state, browser, settings, &scan, kind, &cands, false).await? {
            return Ok(());
        }
    }

    Ok(())
}

/// Try the best candidate for one action family. Returns true when the pass
/// is done with this family (clicked, or cooldown said "already handled").
async fn attempt_action(
    state: &AppState,
    browser: &Arc<PlayerBrowser>,
    settings: &Settings,
    scan: &ScanResult,
    kind: ActionKind,
    candidates: &[Candidate],
    manual: bool,
) -> Result<bool> {
    for cand in candidates {
        let Some(el) = scan.candidates.iter().find(|e| e.index == cand.index) else {
            continue;
        };
        let Some(target) = dom::resolve_clickable(el) else {
            continue;
        };

        {
            let mut s = state.lock().await;
            if !s.gate.try_acquire(kind, Instant::now()) {
                tracing::debug!("{} within cooldown window, already handled", kind.as_str());
                return Ok(true);
            }
        }

        let delay = settings.skip_delay_ms.clamp(0, 5000);
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }

        let mut forced = false;
        let clicked = if target_is_visible(el, target, &scan.viewport) {
            browser.click(el.index, target).await.unwrap_or(false)
        } else {
            forced = true;
            force_reveal_click(browser, el, &scan.viewport).await?
        };

        if clicked {
            tracing::info!(
                "clicked {} candidate (score {}, label {:?}{})",
                kind.as_str(),
                cand.score,
                cand.label.chars().take(60).collect::<String>(),
                if forced { ", force-revealed" } else { "" },
            );
            let record = ActionRecord {
                at: Utc::now(),
                kind,
                label: cand.label.clone(),
                score: cand.score,
                forced_reveal: forced,
                manual,
            };
            let mut s = state.lock().await;
            log_action(&s.config, &record);
            s.record_action(record);
        }

        // One attempt per pass; the next poll is the retry.
        return Ok(clicked);
    }
    Ok(false)
}

fn target_is_visible(el: &ElementSnapshot, target: ClickTarget, viewport: &Viewport) -> bool {
    match target {
        ClickTarget::Own | ClickTarget::Ancestor(_) => el.is_visible(viewport),
        ClickTarget::Descendant(i) => el
            .clickable_descendants
            .get(i)
            .is_some_and(|d| dom::is_visible(&d.rect, &d.style, viewport)),
    }
}

/// Reveal a pre-mounted but hidden target, click it, and put every touched
/// attribute back exactly as recorded, click or no click.
async fn force_reveal_click(
    browser: &Arc<PlayerBrowser>,
    el: &ElementSnapshot,
    viewport: &Viewport,
) -> Result<bool> {
    let Some(saved) = browser.reveal(el.index).await? else {
        return Ok(false);
    };
    let ticket = RevealTicket::new(el.index, saved);

    sleep(Duration::from_millis(REVEAL_SETTLE_MS)).await;

    let mut clicked = false;
    let chosen = match browser.snapshot(el.index).await {
        Ok(Some(fresh)) => {
            // Styles may have re-flowed the subtree; resolve again.
            let mut pick = dom::resolve_clickable(&fresh)
                .filter(|t| target_is_visible(&fresh, *t, viewport));
            if pick.is_none() {
                pick = dom::pick_visible_descendant(&fresh, viewport);
            }
            if pick.is_none() {
                sleep(Duration::from_millis(REVEAL_LAST_CHANCE_MS)).await;
                if let Ok(Some(again)) = browser.snapshot(el.index).await {
                    pick = dom::resolve_clickable(&again)
                        .filter(|t| target_is_visible(&again, *t, viewport))
                        .or_else(|| dom::pick_visible_descendant(&again, viewport));
                }
            }
            pick
        }
        _ => None,
    };

    if let Some(target) = chosen {
        clicked = browser.click(el.index, target).await.unwrap_or(false);
    }

    if let Err(e) = browser.restore(ticket.index, ticket.restore_payload()).await {
        tracing::warn!("force-reveal restore failed: {e:#}");
    }

    Ok(clicked)
}

/// While the per-show rule asks for it and the episode is in its credits
/// phase, cap the volume at the configured level; restore the saved volume
/// as soon as the condition lapses.
async fn handle_credits_volume(
    state: &AppState,
    browser: &Arc<PlayerBrowser>,
    settings: &Settings,
    rules: &EffectiveRules,
    phase: PlaybackPhase,
    video: &VideoState,
) {
    let should_duck = settings.global_enabled
        && rules.lower_volume_during_credits
        && phase == PlaybackPhase::Credits
        && video.present;

    let saved = {
        let s = state.lock().await;
        s.ducked_volume
    };

    if should_duck {
        let saved = match saved {
            Some(v) => v,
            None => {
                let mut s = state.lock().await;
                s.ducked_volume = Some(video.volume);
                video.volume
            }
        };
        let target = f64::from(settings.volume_level_pct.min(100)) / 100.0;
        let cap = saved.min(target);
        if video.volume > cap + 0.005
            && let Err(e) = browser.set_volume(cap).await
        {
            tracing::warn!("credits volume duck failed: {e:#}");
        }
    } else if let Some(prev) = saved {
        if let Err(e) = browser.set_volume(prev).await {
            tracing::warn!("credits volume restore failed: {e:#}");
        }
        let mut s = state.lock().await;
        s.ducked_volume = None;
    }
}

/// Manual trigger from the control surface: bypasses per-show gating and
/// phase expectations, but still respects the global kill switch and the
/// cooldown gate.
pub async fn trigger_action(state: &AppState, kind: ActionKind) -> Result<bool> {
    let (browser, settings) = {
        let s = state.lock().await;
        (s.browser.clone(), s.settings.clone())
    };
    let browser = browser.context("browser not running")?;

    if !settings.global_enabled {
        return Ok(false);
    }

    let video = browser.video_state().await.unwrap_or_default();
    let phase = classify::playback_phase(&video, &settings.phase);

    let scan = browser.scan().await.context("scan probe failed")?;
    // A manual request widens credits acceptance the way the in-phase scan
    // does, and treats the phase as late for scoring.
    let lenient_phase = if kind == ActionKind::Credits {
        PlaybackPhase::Credits
    } else {
        phase
    };
    let cands = classify::find_candidates(&scan, kind, lenient_phase, true);
    if cands.is_empty() {
        return Ok(false);
    }

    attempt_action(state, &browser, &settings, &scan, kind, &cands, true).await
}

/// Undo a "reduce" end action: restore the volume and mute flag saved when
/// the timer fired.
pub async fn restore_volume(state: &AppState) -> Result<bool> {
    let (browser, saved) = {
        let mut s = state.lock().await;
        (s.browser.clone(), s.pre_end_volume.take())
    };
    let browser = browser.context("browser not running")?;
    let Some((volume, muted)) = saved else {
        return Ok(false);
    };
    browser.set_muted(muted).await.ok();
    browser.set_volume(volume).await.context("volume restore failed")?;
    browser.set_dim(false).await.ok();
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_passes_inside_window_fire_once() {
        let mut gate = CooldownGate::with_windows(300, 600);
        let t0 = Instant::now();
        assert!(gate.try_acquire(ActionKind::Next, t0));
        // The observer-driven rescan lands 50 ms later: absorbed.
        assert!(!gate.try_acquire(ActionKind::Next, t0 + Duration::from_millis(50)));
        // Past both windows it may fire again.
        assert!(gate.try_acquire(ActionKind::Next, t0 + Duration::from_millis(700)));
    }

    #[test]
    fn test_cross_action_window_spans_families() {
        let mut gate = CooldownGate::with_windows(300, 600);
        let t0 = Instant::now();
        assert!(gate.try_acquire(ActionKind::Intro, t0));
        // A different family 400 ms later is still inside the cross window.
        assert!(!gate.try_acquire(ActionKind::Credits, t0 + Duration::from_millis(400)));
        assert!(gate.try_acquire(ActionKind::Credits, t0 + Duration::from_millis(650)));
    }

    #[test]
    fn test_family_window_outlives_cross_window() {
        let mut gate = CooldownGate::with_windows(1000, 100);
        let t0 = Instant::now();
        assert!(gate.try_acquire(ActionKind::Intro, t0));
        // Cross window has lapsed but the intro family is still cooling.
        assert!(!gate.try_acquire(ActionKind::Intro, t0 + Duration::from_millis(500)));
        // Another family only has the (lapsed) cross window to clear.
        assert!(gate.try_acquire(ActionKind::Next, t0 + Duration::from_millis(500)));
    }

    #[test]
    fn test_reconfigure_keeps_stamps() {
        let mut gate = CooldownGate::with_windows(300, 300);
        let t0 = Instant::now();
        assert!(gate.try_acquire(ActionKind::Next, t0));

        let mut settings = Settings::default();
        settings.click_cooldown_ms = 2000;
        settings.min_auto_cooldown_ms = 2000;
        gate.reconfigure(&settings);

        // The widened window applies to the stamp already taken.
        assert!(!gate.try_acquire(ActionKind::Next, t0 + Duration::from_millis(500)));
    }
}
