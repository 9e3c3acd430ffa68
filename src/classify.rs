use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dom::{ElementSnapshot, ScanResult, VideoState, Viewport};
use crate::settings::PhasePolicy;

/// The automation families the engine knows how to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Intro,
    Credits,
    Next,
}

impl ActionKind {
    pub const ALL: [ActionKind; 3] = [ActionKind::Intro, ActionKind::Credits, ActionKind::Next];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Intro => "intro",
            ActionKind::Credits => "credits",
            ActionKind::Next => "next",
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intro" => Ok(ActionKind::Intro),
            "credits" => Ok(ActionKind::Credits),
            "next" => Ok(ActionKind::Next),
            _ => Err(()),
        }
    }
}

/// Coarse position within the episode, derived from currentTime ÷ duration.
/// A signal for the scorer, never a hard gate: seeks and short episodes put
/// real controls outside the expected window often enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackPhase {
    Intro,
    Middle,
    Credits,
    Unknown,
}

pub fn playback_phase(video: &VideoState, policy: &PhasePolicy) -> PlaybackPhase {
    match video.progress() {
        Some(p) if p < policy.intro_max_fraction() => PlaybackPhase::Intro,
        Some(p) if p > policy.credits_min_fraction() => PlaybackPhase::Credits,
        Some(_) => PlaybackPhase::Middle,
        None => PlaybackPhase::Unknown,
    }
}

/// Whether playback is far enough along that a next/credits CTA is expected.
pub fn is_late_phase(video: &VideoState, policy: &PhasePolicy) -> bool {
    video
        .progress()
        .is_some_and(|p| p >= policy.next_late_fraction())
}

// Vocabulary. The skip verb and credits words carry the localized forms the
// host page is known to ship.
static RE_SKIP_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(skip|saltar|salta|pular|\u{00FC}berspringen|omitir|passer|ignora|\u{043F}\u{0440}\u{043E}\u{043F}\u{0443}\u{0441}\u{0442}\u{0438}\u{0442}\u{044C}|skippa)\b").unwrap()
});
static RE_INTRO_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(intro|recap|opening|theme)\b").unwrap());
static RE_CREDITS_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(credits?|end\s*credits?|ending|outro|post[-\s]?credits?|postcredits?|credits?\s*scene|finale|gen[e\u{00E9}]rique|abspann|cr[e\u{00E9}]ditos|cr[e\u{00EA}]ditos|titres de fin|finais|fim)\b").unwrap()
});
static RE_NEXT_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(play\s*next|next\s*episode|watch\s*next|continue\s*to\s*next|up\s*next)\b")
        .unwrap()
});
static RE_CONTINUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcontinue\b").unwrap());
static RE_CONTINUE_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcontinue\s*watching\s*from\b").unwrap());

static RE_NEXT_NEGATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(autoplay\s*(on|off)?|settings|preferences|audio|subtitles|resume)\b")
        .unwrap()
});
static RE_CREDITS_NEGATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(up ?next|play next|next episode|autoplay|continue)\b").unwrap()
});
static RE_PLAY_OR_NEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(play|next)\b").unwrap());

/// Transport wording that numerically resembles a skip action but is not one.
static RE_TRANSPORT_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(10\s*(sec|seconds)|ten\s*seconds|seek|scrub|timeline|progress|jump|rewind|replay\s*10|forward\s*10|skip\s*(ahead|back)\s*10)\b").unwrap()
});

static RE_OVERLAY_INTRO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(overlay|fullplayer|upnext|intro)").unwrap());
static RE_OVERLAY_CREDITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(overlay|fullplayer|upnext|credits)").unwrap());
static RE_OVERLAY_NEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(overlay|fullplayer|upnext|autoplay)").unwrap());

/// "play next" vocabulary with the "continue watching from …" resume row
/// carved out (the regex engine has no lookahead, so the carve-out is a
/// second match).
fn has_next_vocab(label: &str) -> bool {
    RE_NEXT_WORDS.is_match(label)
        || (RE_CONTINUE.is_match(label) && !RE_CONTINUE_FROM.is_match(label))
}

/// Structural selector set handed to the page-side collector: the union of
/// every action family's selectors. Label filtering per family happens here,
/// on the snapshots.
pub const STRUCTURAL_SELECTORS: &[&str] = &[
    "button",
    "[role=button]",
    "a[role=button]",
    r#"[class*="OverlayButton"]"#,
    r#"[class*="overlayButton"]"#,
    r#"[class*="FullPlayer"] [class*="Button"]"#,
    r#"[class*="UpNext"] [class*="Button"]"#,
    r#"[data-testid*="skip" i]"#,
    r#"[data-qa-id*="skip" i]"#,
    r#"[class*="Skip" i]"#,
    r#"[class*="skip" i]"#,
    r#"[data-testid*="next" i]"#,
    r#"[data-qa-id*="next" i]"#,
    r#"[class*="Next" i]"#,
    r#"[class*="next" i]"#,
];

/// Traversal depth bound for shadow roots / nested iframes.
pub const SCAN_MAX_DEPTH: u32 = 8;

/// A scored element provisionally matching an action's criteria. Borrowed
/// from the current pass's registry; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub index: usize,
    pub label: String,
    pub score: i32,
}

/// The normalized text signature for a node: accessible label, title
/// attribute, own text, then nearby overlay context, whitespace collapsed.
pub fn label_of(el: &ElementSnapshot) -> String {
    let joined = format!(
        "{} {} {} {}",
        el.aria_label, el.title_attr, el.own_text, el.near_text
    );
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn has_overlay_ancestry(el: &ElementSnapshot, kind: ActionKind) -> bool {
    let re = match kind {
        ActionKind::Intro => &*RE_OVERLAY_INTRO,
        ActionKind::Credits => &*RE_OVERLAY_CREDITS,
        ActionKind::Next => &*RE_OVERLAY_NEXT,
    };
    el.ancestor_classes.iter().any(|c| re.is_match(c))
}

fn matches_kind(kind: ActionKind, label: &str, overlayish: bool, phase: PlaybackPhase) -> bool {
    match kind {
        ActionKind::Intro => {
            RE_INTRO_WORDS.is_match(label) && (RE_SKIP_WORD.is_match(label) || overlayish)
        }
        ActionKind::Credits => {
            if RE_CREDITS_NEGATIVE.is_match(label) {
                return false;
            }
            let creditsish = RE_CREDITS_WORDS.is_match(label);
            let has_skip = RE_SKIP_WORD.is_match(label);
            if phase == PlaybackPhase::Credits {
                // Inside the credits window overlays may omit the word
                // "skip" while still being the right target.
                has_skip || (overlayish && creditsish)
            } else {
                has_skip && creditsish
            }
        }
        ActionKind::Next => {
            if RE_NEXT_NEGATIVE.is_match(label) {
                return false;
            }
            has_next_vocab(label)
        }
    }
}

const PROMINENT_AREA: f64 = 1500.0;

/// Pure scoring: label + geometry + phase + ancestry in, number out.
pub fn score_candidate(
    kind: ActionKind,
    el: &ElementSnapshot,
    label: &str,
    late: bool,
    overlayish: bool,
    viewport: &Viewport,
) -> i32 {
    let mut s = 0;
    match kind {
        ActionKind::Intro => {
            if RE_SKIP_WORD.is_match(label) {
                s += 2;
            }
            if RE_INTRO_WORDS.is_match(label) {
                s += 3;
            }
            if overlayish {
                s += 2;
            }
            if RE_PLAY_OR_NEXT.is_match(label) {
                s -= 2;
            }
        }
        ActionKind::Credits => {
            if RE_SKIP_WORD.is_match(label) {
                s += 2;
            }
            if RE_CREDITS_WORDS.is_match(label) {
                s += 4;
            }
            if overlayish {
                s += 3;
            }
            if late {
                s += 2;
            }
        }
        ActionKind::Next => {
            if has_next_vocab(label) {
                s += 4;
            }
            if overlayish {
                s += 3;
            }
            if late {
                s += 2;
            }
        }
    }

    if el.rect.area() > PROMINENT_AREA {
        s += 1;
    }
    let cx = (el.rect.center_x() - viewport.width / 2.0).abs();
    let cy = (el.rect.center_y() - viewport.height / 2.0).abs();
    if cx < viewport.width * 0.35 {
        s += 1;
    }
    if cy < viewport.height * 0.45 {
        s += 1;
    }
    s
}

/// Scan → candidates for one action family, best first. Ties keep traversal
/// order (the sort is stable), which makes selection deterministic.
pub fn find_candidates(
    scan: &ScanResult,
    kind: ActionKind,
    phase: PlaybackPhase,
    late: bool,
) -> Vec<Candidate> {
    let mut out = Vec::new();

    for el in &scan.candidates {
        if el.in_menu || el.is_transport() {
            continue;
        }
        // Intro and credits act on visible buttons only; next keeps hidden
        // pre-mounted CTAs and lets the force-reveal engine surface them.
        if kind != ActionKind::Next && !el.is_visible(&scan.viewport) {
            continue;
        }

        let label = label_of(el);
        if label.is_empty() || RE_TRANSPORT_LABEL.is_match(&label) {
            continue;
        }

        let overlayish = has_overlay_ancestry(el, kind);
        if !matches_kind(kind, &label, overlayish, phase) {
            continue;
        }

        let score = score_candidate(kind, el, &label, late, overlayish, &scan.viewport);
        out.push(Candidate {
            index: el.index,
            label,
            score,
        });
    }

    out.sort_by(|a, b| b.score.cmp(&a.score));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{NodeStyle, Rect};

    fn snapshot(label: &str, classes: &[&str]) -> ElementSnapshot {
        ElementSnapshot {
            tag: "button".into(),
            own_text: label.into(),
            rect: Rect {
                left: 560.0,
                top: 320.0,
                width: 160.0,
                height: 48.0,
            },
            style: NodeStyle::plain(),
            ancestor_classes: classes.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn scan_of(els: Vec<ElementSnapshot>) -> ScanResult {
        let mut scan = ScanResult {
            player_context: true,
            candidates: els,
            ..Default::default()
        };
        for (i, el) in scan.candidates.iter_mut().enumerate() {
            el.index = i;
        }
        scan
    }

    #[test]
    fn test_intro_button_is_found() {
        let scan = scan_of(vec![snapshot("Skip Intro", &["PlayerOverlay"])]);
        let cands = find_candidates(&scan, ActionKind::Intro, PlaybackPhase::Intro, false);
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].label, "Skip Intro");
    }

    #[test]
    fn test_transport_skip_is_never_an_intro_candidate() {
        let scan = scan_of(vec![snapshot(
            "Skip 10 seconds",
            &["SkipButton", "TransportControls"],
        )]);
        for kind in ActionKind::ALL {
            assert!(
                find_candidates(&scan, kind, PlaybackPhase::Credits, true).is_empty(),
                "{kind:?} accepted a transport control"
            );
        }
    }

    #[test]
    fn test_transport_label_alone_disqualifies() {
        // Clean ancestry, but the label itself is transport wording.
        let scan = scan_of(vec![snapshot("Replay 10", &["PlayerOverlay"])]);
        assert!(find_candidates(&scan, ActionKind::Intro, PlaybackPhase::Intro, false).is_empty());
    }

    #[test]
    fn test_credits_outside_phase_needs_skip_and_credits_words() {
        let bare = scan_of(vec![snapshot("Credits", &["PlayerOverlay"])]);
        assert!(
            find_candidates(&bare, ActionKind::Credits, PlaybackPhase::Middle, false).is_empty()
        );

        let labeled = scan_of(vec![snapshot("Skip Credits", &["PlayerOverlay"])]);
        assert_eq!(
            find_candidates(&labeled, ActionKind::Credits, PlaybackPhase::Middle, false).len(),
            1
        );
    }

    #[test]
    fn test_credits_phase_widens_to_overlay_vocabulary() {
        // No "skip" word, but credits vocabulary inside an overlay ancestry
        // qualifies once the playback phase says credits.
        let scan = scan_of(vec![snapshot("End Credits", &["CreditsOverlay"])]);
        assert!(
            find_candidates(&scan, ActionKind::Credits, PlaybackPhase::Middle, false).is_empty()
        );
        assert_eq!(
            find_candidates(&scan, ActionKind::Credits, PlaybackPhase::Credits, true).len(),
            1
        );
    }

    #[test]
    fn test_next_rejects_autoplay_toggle() {
        let scan = scan_of(vec![snapshot("Autoplay on", &["UpNextOverlay"])]);
        assert!(find_candidates(&scan, ActionKind::Next, PlaybackPhase::Credits, true).is_empty());
    }

    #[test]
    fn test_next_rejects_resume_row() {
        let scan = scan_of(vec![snapshot(
            "Continue watching from 12:01",
            &["PlayerOverlay"],
        )]);
        assert!(find_candidates(&scan, ActionKind::Next, PlaybackPhase::Middle, false).is_empty());
    }

    #[test]
    fn test_next_accepts_plain_continue() {
        let scan = scan_of(vec![snapshot("Continue", &["UpNextOverlay"])]);
        assert_eq!(
            find_candidates(&scan, ActionKind::Next, PlaybackPhase::Credits, true).len(),
            1
        );
    }

    #[test]
    fn test_next_keeps_hidden_candidates_for_force_reveal() {
        let mut el = snapshot("Play Next Episode", &["AudioVideoUpNext-overlay"]);
        el.style.opacity = 0.0;
        let scan = scan_of(vec![el]);
        assert_eq!(
            find_candidates(&scan, ActionKind::Next, PlaybackPhase::Credits, true).len(),
            1
        );
        // The same hidden element is dropped for intro, which only clicks
        // what is already visible.
        let mut intro = snapshot("Skip Intro", &["PlayerOverlay"]);
        intro.style.opacity = 0.0;
        let scan = scan_of(vec![intro]);
        assert!(find_candidates(&scan, ActionKind::Intro, PlaybackPhase::Intro, false).is_empty());
    }

    #[test]
    fn test_scoring_prefers_specific_overlay_cta() {
        let generic = snapshot("Next Episode", &["SomePanel"]);
        let specific = snapshot("Play Next Episode", &["UpNextOverlay"]);
        let scan = scan_of(vec![generic, specific]);
        let cands = find_candidates(&scan, ActionKind::Next, PlaybackPhase::Credits, true);
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].label, "Play Next Episode");
        assert!(cands[0].score > cands[1].score);
    }

    #[test]
    fn test_ties_keep_traversal_order() {
        let a = snapshot("Play Next", &["UpNextOverlay"]);
        let b = snapshot("Watch Next", &["UpNextOverlay"]);
        let scan = scan_of(vec![a, b]);
        let cands = find_candidates(&scan, ActionKind::Next, PlaybackPhase::Credits, true);
        assert_eq!(cands[0].score, cands[1].score);
        assert_eq!(cands[0].index, 0);
        assert_eq!(cands[1].index, 1);
    }

    #[test]
    fn test_late_phase_bumps_score() {
        let el = snapshot("Play Next Episode", &["UpNextOverlay"]);
        let scan = scan_of(vec![el]);
        let early = find_candidates(&scan, ActionKind::Next, PlaybackPhase::Middle, false);
        let late = find_candidates(&scan, ActionKind::Next, PlaybackPhase::Credits, true);
        assert_eq!(late[0].score - early[0].score, 2);
    }

    #[test]
    fn test_label_of_collapses_whitespace_in_order() {
        let el = ElementSnapshot {
            aria_label: "Skip  Intro".into(),
            title_attr: "".into(),
            own_text: "  \n ".into(),
            near_text: "Now   playing".into(),
            ..Default::default()
        };
        assert_eq!(label_of(&el), "Skip Intro Now playing");
    }

    #[test]
    fn test_playback_phase_buckets() {
        let policy = PhasePolicy::default();
        let mk = |t: f64| VideoState {
            present: true,
            current_time: t,
            duration: 100.0,
            ready_state: 4,
            ..Default::default()
        };
        assert_eq!(playback_phase(&mk(10.0), &policy), PlaybackPhase::Intro);
        assert_eq!(playback_phase(&mk(50.0), &policy), PlaybackPhase::Middle);
        assert_eq!(playback_phase(&mk(90.0), &policy), PlaybackPhase::Credits);
        assert_eq!(
            playback_phase(&VideoState::default(), &policy),
            PlaybackPhase::Unknown
        );
        assert!(is_late_phase(&mk(85.0), &policy));
        assert!(!is_late_phase(&mk(70.0), &policy));
    }
}
