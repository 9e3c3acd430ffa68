use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::browser::PlayerBrowser;
use crate::classify::ActionKind;
use crate::config::Config;
use crate::engine::CooldownGate;
use crate::series::SeriesIdentity;
use crate::settings::Settings;
use crate::timer::TimerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    Idle,
    Preparing,
    Ready,
    Running,
    Paused,
}

/// One dispatched automation click.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub at: DateTime<Utc>,
    pub kind: ActionKind,
    pub label: String,
    pub score: i32,
    pub forced_reveal: bool,
    pub manual: bool,
}

/// Overlay placement, persisted per profile and never synced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayPosition {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub minimized: bool,
    pub opacity: f64,
    pub locked: bool,
}

impl Default for OverlayPosition {
    fn default() -> Self {
        OverlayPosition {
            x: 18.0,
            y: 18.0,
            scale: 1.0,
            minimized: false,
            opacity: 1.0,
            locked: false,
        }
    }
}

/// Local (non-synced) persistence: the last known series identity for the
/// control surface plus the overlay position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalState {
    pub last_series_title: String,
    pub last_series_key: String,
    pub overlay: OverlayPosition,
}

impl LocalState {
    /// Best-effort load; this is a cache, a broken file just means defaults.
    pub fn load(path: &Path) -> LocalState {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("ignoring malformed state file {}: {e}", path.display());
                LocalState::default()
            }),
            Err(_) => LocalState::default(),
        }
    }

    pub fn save(&self, path: &Path) {
        match serde_json::to_string_pretty(self) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(path, raw) {
                    tracing::warn!("failed to write {}: {e}", path.display());
                }
            }
            Err(e) => tracing::warn!("failed to serialize local state: {e}"),
        }
    }
}

/// In-memory action history shown by the API; the full log goes to JSONL.
const ACTION_HISTORY_CAP: usize = 100;

pub struct AppStateInner {
    pub phase: EnginePhase,
    pub config: Config,
    /// Immutable snapshot; replaced wholesale on change, never edited in
    /// place.
    pub settings: Arc<Settings>,
    pub browser: Option<Arc<PlayerBrowser>>,
    pub series: SeriesIdentity,
    pub timer: TimerState,
    pub gate: CooldownGate,
    pub engine_handle: Option<JoinHandle<()>>,
    pub pause_notify: Arc<Notify>,
    pub actions: Vec<ActionRecord>,
    pub local: LocalState,
    /// Volume/mute before a "reduce" end action, for the manual restore.
    pub pre_end_volume: Option<(f64, bool)>,
    /// Volume before the credits duck kicked in.
    pub ducked_volume: Option<f64>,
}

pub type AppState = Arc<Mutex<AppStateInner>>;

impl AppStateInner {
    pub fn new(config: Config, settings: Settings, local: LocalState) -> Self {
        let gate = CooldownGate::from_settings(&settings);
        Self {
            phase: EnginePhase::Idle,
            config,
            settings: Arc::new(settings),
            browser: None,
            series: SeriesIdentity::unknown(),
            timer: TimerState::default(),
            gate,
            engine_handle: None,
            pause_notify: Arc::new(Notify::new()),
            actions: Vec::new(),
            local,
            pre_end_volume: None,
            ducked_volume: None,
        }
    }

    pub fn record_action(&mut self, record: ActionRecord) {
        self.actions.push(record);
        if self.actions.len() > ACTION_HISTORY_CAP {
            let excess = self.actions.len() - ACTION_HISTORY_CAP;
            self.actions.drain(..excess);
        }
    }

    /// Update the current series identity; returns true when it changed and
    /// the local file should be rewritten.
    pub fn update_series(&mut self, identity: SeriesIdentity) -> bool {
        if self.series == identity {
            return false;
        }
        self.local.last_series_title = identity.display_title.clone();
        self.local.last_series_key = identity.canonical_key.clone();
        self.series = identity;
        true
    }

    pub fn persist_local(&self) {
        self.local.save(&self.config.state_file);
    }
}
