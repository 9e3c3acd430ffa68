use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};

use crate::series;
use crate::state::AppState;
use crate::timer::TimerEndAction;

/// Per-show behavior overrides, keyed by canonical series key. Unset fields
/// fall through to the global defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShowRule {
    pub skip_intro: Option<bool>,
    pub skip_credits: Option<bool>,
    pub next_episode: Option<bool>,
    pub lower_volume_during_credits: Option<bool>,
}

/// Rules after defaults, legacy fallback and the disabled set are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectiveRules {
    pub skip_intro: bool,
    pub skip_credits: bool,
    pub next_episode: bool,
    pub lower_volume_during_credits: bool,
}

/// Playback-phase thresholds, in percent. Source variants disagreed on the
/// exact numbers, so they are policy, not constants; accessors clamp to
/// sane windows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasePolicy {
    pub intro_max_pct: f64,
    pub credits_min_pct: f64,
    pub next_late_pct: f64,
}

impl Default for PhasePolicy {
    fn default() -> Self {
        PhasePolicy {
            intro_max_pct: 30.0,
            credits_min_pct: 65.0,
            next_late_pct: 80.0,
        }
    }
}

impl PhasePolicy {
    pub fn intro_max_fraction(&self) -> f64 {
        (self.intro_max_pct / 100.0).clamp(0.05, 0.5)
    }

    pub fn credits_min_fraction(&self) -> f64 {
        (self.credits_min_pct / 100.0).clamp(0.4, 0.95)
    }

    pub fn next_late_fraction(&self) -> f64 {
        (self.next_late_pct / 100.0).clamp(0.5, 0.98)
    }
}

/// Cosmetic preferences for the external countdown overlay. The core only
/// stores and serves these; rendering happens elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    pub opacity: f64,
    pub auto_hide: bool,
    pub auto_hide_sec: u32,
    pub snap: bool,
    pub show_end_time: bool,
    pub show_actions: bool,
    pub locked: bool,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        OverlaySettings {
            opacity: 1.0,
            auto_hide: false,
            auto_hide_sec: 4,
            snap: true,
            show_end_time: true,
            show_actions: true,
            locked: false,
        }
    }
}

/// The full settings snapshot. Read by value everywhere; writes replace the
/// whole `Arc` so a scan pass never observes a half-applied update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub global_enabled: bool,
    pub default_skip_intro: bool,
    pub default_skip_credits: bool,
    pub default_next_episode: bool,

    pub skip_delay_ms: u64,
    pub min_auto_cooldown_ms: u64,
    pub click_cooldown_ms: u64,
    pub scan_interval_ms: u64,
    pub timer_tick_ms: u64,

    pub phase: PhasePolicy,

    /// Volume cap (percent) while ducking during credits.
    pub volume_level_pct: u8,

    pub timer_end_action: TimerEndAction,
    pub reduce_audio_level_pct: u8,
    pub dim_screen: bool,
    pub timer_end_chime: bool,
    pub timer_end_chime_volume_pct: u8,
    pub fade_before_end: bool,
    pub fade_seconds: f64,

    pub countdown_visible: bool,
    pub overlay: OverlaySettings,

    pub per_show_rules_by_key: BTreeMap<String, ShowRule>,
    /// Legacy map keyed by display title; consulted when the keyed map has
    /// no entry.
    pub per_show_rules_by_title: BTreeMap<String, ShowRule>,
    pub disabled_series_keys: BTreeSet<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            global_enabled: true,
            default_skip_intro: true,
            default_skip_credits: true,
            default_next_episode: true,
            skip_delay_ms: 500,
            min_auto_cooldown_ms: 600,
            click_cooldown_ms: 300,
            scan_interval_ms: 500,
            timer_tick_ms: 250,
            phase: PhasePolicy::default(),
            volume_level_pct: 50,
            timer_end_action: TimerEndAction::Pause,
            reduce_audio_level_pct: 10,
            dim_screen: true,
            timer_end_chime: false,
            timer_end_chime_volume_pct: 40,
            fade_before_end: true,
            fade_seconds: 20.0,
            countdown_visible: false,
            overlay: OverlaySettings::default(),
            per_show_rules_by_key: BTreeMap::new(),
            per_show_rules_by_title: BTreeMap::new(),
            disabled_series_keys: BTreeSet::new(),
        }
    }
}

impl Settings {
    /// Effective rules for a show: keyed map first, then the legacy
    /// display-title map (direct hit, then canonical-key match), then global
    /// defaults. A show in the disabled set loses skip-intro/skip-credits
    /// regardless of its stored rule; next-episode is unaffected.
    pub fn rules_for(&self, canonical_key: &str, display_title: &str) -> EffectiveRules {
        let rule = self
            .per_show_rules_by_key
            .get(canonical_key)
            .or_else(|| self.per_show_rules_by_title.get(display_title))
            .or_else(|| {
                self.per_show_rules_by_title
                    .iter()
                    .find(|(title, _)| series::series_key(title) == canonical_key)
                    .map(|(_, r)| r)
            })
            .cloned()
            .unwrap_or_default();

        let disabled = self.disabled_series_keys.contains(canonical_key);

        EffectiveRules {
            skip_intro: !disabled && rule.skip_intro.unwrap_or(self.default_skip_intro),
            skip_credits: !disabled && rule.skip_credits.unwrap_or(self.default_skip_credits),
            next_episode: rule.next_episode.unwrap_or(self.default_next_episode),
            lower_volume_during_credits: rule.lower_volume_during_credits.unwrap_or(false),
        }
    }

    /// Load from a JSON file; a missing file means defaults, a malformed one
    /// is an error the caller decides about.
    pub fn load(path: &Path) -> Result<Settings> {
        if !path.exists() {
            tracing::info!("no settings file at {}, using defaults", path.display());
            return Ok(Settings::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Watch the settings file for external edits and swap the snapshot in
/// wholesale. A plain mtime poll: the file is small and edits are rare.
pub async fn run_settings_watch(state: AppState) {
    let path = {
        let s = state.lock().await;
        s.config.settings_file.clone()
    };

    let mut last_mtime = mtime_of(&path);

    loop {
        sleep(Duration::from_secs(2)).await;

        let mtime = mtime_of(&path);
        if mtime == last_mtime {
            continue;
        }
        last_mtime = mtime;

        match Settings::load(&path) {
            Ok(fresh) => {
                let mut s = state.lock().await;
                if *s.settings != fresh {
                    tracing::info!("settings file changed, reloading snapshot");
                    s.settings = Arc::new(fresh);
                }
            }
            Err(e) => {
                tracing::warn!("settings reload failed, keeping previous snapshot: {e:#}");
            }
        }
    }
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rule_map_means_defaults_on() {
        let settings = Settings::default();
        let r = settings.rules_for("my show", "My Show");
        assert!(r.skip_intro);
        assert!(r.skip_credits);
        assert!(r.next_episode);
        assert!(!r.lower_volume_during_credits);
    }

    #[test]
    fn test_keyed_rule_overrides_defaults() {
        let mut settings = Settings::default();
        settings.per_show_rules_by_key.insert(
            "my show".into(),
            ShowRule {
                skip_intro: Some(false),
                ..Default::default()
            },
        );
        let r = settings.rules_for("my show", "My Show");
        assert!(!r.skip_intro);
        assert!(r.skip_credits);
    }

    #[test]
    fn test_legacy_title_rule_found_by_canonical_key() {
        let mut settings = Settings::default();
        settings.per_show_rules_by_title.insert(
            "My Show - S2E5".into(),
            ShowRule {
                skip_credits: Some(false),
                ..Default::default()
            },
        );
        // Looked up under the canonical key even though the stored title
        // carries an episode marker.
        let r = settings.rules_for("my show", "My Show");
        assert!(!r.skip_credits);
    }

    #[test]
    fn test_disabled_set_forces_skips_off_but_not_next() {
        let mut settings = Settings::default();
        settings.per_show_rules_by_key.insert(
            "my show".into(),
            ShowRule {
                skip_intro: Some(true),
                skip_credits: Some(true),
                next_episode: Some(true),
                ..Default::default()
            },
        );
        settings.disabled_series_keys.insert("my show".into());

        let r = settings.rules_for("my show", "My Show");
        assert!(!r.skip_intro, "disabled set must win over stored rule");
        assert!(!r.skip_credits);
        assert!(r.next_episode, "next-episode is untouched by the disabled set");
    }

    #[test]
    fn test_phase_policy_clamps() {
        let policy = PhasePolicy {
            intro_max_pct: 200.0,
            credits_min_pct: 1.0,
            next_late_pct: 200.0,
        };
        assert_eq!(policy.intro_max_fraction(), 0.5);
        assert_eq!(policy.credits_min_fraction(), 0.4);
        assert_eq!(policy.next_late_fraction(), 0.98);
    }

    #[test]
    fn test_settings_round_trip() {
        let mut settings = Settings::default();
        settings.global_enabled = false;
        settings.disabled_series_keys.insert("some show".into());
        settings.per_show_rules_by_key.insert(
            "some show".into(),
            ShowRule {
                next_episode: Some(false),
                ..Default::default()
            },
        );

        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_partial_settings_file_fills_defaults() {
        let back: Settings = serde_json::from_str(r#"{"global_enabled": false}"#).unwrap();
        assert!(!back.global_enabled);
        assert_eq!(back.skip_delay_ms, 500);
        assert_eq!(back.phase, PhasePolicy::default());
    }
}
