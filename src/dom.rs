use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Bounding box in CSS pixels, as reported by `getBoundingClientRect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    pub fn center_x(&self) -> f64 {
        self.left + self.width / 2.0
    }

    pub fn center_y(&self) -> f64 {
        self.top + self.height / 2.0
    }
}

/// Viewport dimensions of the document a snapshot was taken from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport {
            width: 1920.0,
            height: 1080.0,
        }
    }
}

/// The computed-style fields the heuristics care about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStyle {
    pub display_none: bool,
    pub visibility_hidden: bool,
    pub opacity: f64,
    pub pointer_events_none: bool,
    pub cursor_pointer: bool,
}

impl NodeStyle {
    /// A style that passes every visibility check; handy in tests.
    #[cfg(test)]
    pub fn plain() -> Self {
        NodeStyle {
            opacity: 1.0,
            ..Default::default()
        }
    }
}

/// One ancestor of a matched element, nearest first in
/// [`ElementSnapshot::ancestors`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AncestorSnapshot {
    pub tag: String,
    pub role: String,
    pub has_onclick: bool,
    pub opacity: f64,
    pub pointer_events_none: bool,
    pub cursor_pointer: bool,
    pub in_menu: bool,
}

/// A clickable descendant recorded for the fallback path of
/// [`resolve_clickable`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DescendantSnapshot {
    pub tag: String,
    pub role: String,
    pub rect: Rect,
    pub style: NodeStyle,
    pub has_onclick: bool,
    pub in_menu: bool,
    pub ancestor_classes: Vec<String>,
}

/// Raw facts about one element matched by the structural selector set.
/// The `index` addresses the page-side registry entry and is only valid for
/// the pass that produced it; the registry is rebuilt on every scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementSnapshot {
    pub index: usize,
    pub tag: String,
    pub role: String,
    pub aria_label: String,
    pub title_attr: String,
    pub own_text: String,
    pub near_text: String,
    pub rect: Rect,
    pub style: NodeStyle,
    pub has_onclick: bool,
    pub in_menu: bool,
    /// Class strings of the element itself and up to ten ancestors,
    /// self first.
    pub ancestor_classes: Vec<String>,
    /// Up to eight ancestors, nearest first.
    pub ancestors: Vec<AncestorSnapshot>,
    pub clickable_descendants: Vec<DescendantSnapshot>,
}

/// Result of one scan probe.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScanResult {
    pub viewport: Viewport,
    /// Monotonic count of DOM mutations observed since the bootstrap ran.
    pub mutations: u64,
    /// Whether the page currently looks like a player context (a `<video>`
    /// or player/up-next chrome is present).
    pub player_context: bool,
    pub candidates: Vec<ElementSnapshot>,
}

/// State of the best `<video>` on the page (largest visible playing one).
/// Shared lookup primitive for both the classifier and the sleep timer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoState {
    pub present: bool,
    pub paused: bool,
    pub ended: bool,
    pub ready_state: u8,
    pub current_time: f64,
    pub duration: f64,
    pub volume: f64,
    pub muted: bool,
}

impl VideoState {
    pub fn is_playing(&self) -> bool {
        self.present && !self.paused && !self.ended && self.ready_state >= 2
    }

    /// Fraction of the episode played, when the duration is known.
    pub fn progress(&self) -> Option<f64> {
        if self.present && self.duration.is_finite() && self.duration > 0.0 {
            Some((self.current_time / self.duration).clamp(0.0, 1.0))
        } else {
            None
        }
    }

    pub fn remaining_secs(&self) -> f64 {
        if self.present && self.duration.is_finite() && self.duration > 0.0 {
            (self.duration - self.current_time).max(0.0)
        } else {
            0.0
        }
    }
}

/// Title sources reported by the probe.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TitleProbe {
    pub metadata_title: Option<String>,
    pub document_title: String,
}

/// Where a click should land relative to a candidate, resolved from its
/// snapshot: the node itself, one of its recorded ancestors, or a clickable
/// descendant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "which", content = "hop")]
pub enum ClickTarget {
    Own,
    Ancestor(usize),
    Descendant(usize),
}

/// Persistent player chrome (seek bar, 10-second skips, scrubber) that must
/// never be mistaken for a content-aware skip button.
static RE_TRANSPORT_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(transport|control|seek|skipforward|skipback|replay|timeline|scrub|progress|osd)")
        .unwrap()
});

/// True when any class in the chain marks the node as part of the transport
/// chrome.
pub fn is_transport(class_chain: &[String]) -> bool {
    class_chain.iter().any(|c| RE_TRANSPORT_CLASS.is_match(c))
}

/// Minimum box dimension for an element to count as visible. Tolerates
/// mid-fade elements while rejecting fully collapsed ones.
const MIN_VISIBLE_DIM: f64 = 8.0;
const MIN_VISIBLE_OPACITY: f64 = 0.06;

/// Whether the element is genuinely visible and hit-testable under the
/// current layout.
pub fn is_visible(rect: &Rect, style: &NodeStyle, viewport: &Viewport) -> bool {
    rect.width >= MIN_VISIBLE_DIM
        && rect.height >= MIN_VISIBLE_DIM
        && rect.bottom() >= 0.0
        && rect.right() >= 0.0
        && rect.top <= viewport.height
        && rect.left <= viewport.width
        && !style.display_none
        && !style.visibility_hidden
        && style.opacity > MIN_VISIBLE_OPACITY
        && !style.pointer_events_none
}

impl ElementSnapshot {
    pub fn is_visible(&self, viewport: &Viewport) -> bool {
        is_visible(&self.rect, &self.style, viewport)
    }

    pub fn is_transport(&self) -> bool {
        is_transport(&self.ancestor_classes)
    }

    /// Class chain seen from the ancestor at `idx` (nearest first) upward.
    fn ancestor_class_chain(&self, idx: usize) -> &[String] {
        let start = (idx + 1).min(self.ancestor_classes.len());
        &self.ancestor_classes[start..]
    }
}

const CLICKABLE_WALK_LIMIT: usize = 8;

fn node_is_clickable(
    tag: &str,
    role: &str,
    has_onclick: bool,
    opacity: f64,
    pointer_events_none: bool,
    cursor_pointer: bool,
) -> bool {
    tag.eq_ignore_ascii_case("button")
        || role.eq_ignore_ascii_case("button")
        || has_onclick
        || (opacity > MIN_VISIBLE_OPACITY
            && !pointer_events_none
            && (cursor_pointer || tag.eq_ignore_ascii_case("a")))
}

/// Resolve the element that should actually receive the click: walk up the
/// recorded ancestors looking for the first real clickable that is not a
/// transport control, stopping at menu containers; fall back to a clickable
/// descendant, then to the node itself. Returns `None` when every option is
/// a transport control or lives inside a menu.
pub fn resolve_clickable(el: &ElementSnapshot) -> Option<ClickTarget> {
    // The node itself counts as step zero of the walk.
    if !el.in_menu
        && node_is_clickable(
            &el.tag,
            &el.role,
            el.has_onclick,
            el.style.opacity,
            el.style.pointer_events_none,
            el.style.cursor_pointer,
        )
        && !el.is_transport()
    {
        return Some(ClickTarget::Own);
    }

    for (i, anc) in el.ancestors.iter().take(CLICKABLE_WALK_LIMIT).enumerate() {
        if anc.in_menu {
            break;
        }
        let clickable = node_is_clickable(
            &anc.tag,
            &anc.role,
            anc.has_onclick,
            anc.opacity,
            anc.pointer_events_none,
            anc.cursor_pointer,
        );
        if clickable && !is_transport(el.ancestor_class_chain(i)) {
            return Some(ClickTarget::Ancestor(i));
        }
    }

    for (i, desc) in el.clickable_descendants.iter().enumerate() {
        if !desc.in_menu && !is_transport(&desc.ancestor_classes) {
            return Some(ClickTarget::Descendant(i));
        }
    }

    if !el.in_menu && !el.is_transport() {
        return Some(ClickTarget::Own);
    }
    None
}

/// First descendant that is itself visible and safe to click; the last-resort
/// target after a force-reveal fails to surface the primary one.
pub fn pick_visible_descendant(el: &ElementSnapshot, viewport: &Viewport) -> Option<ClickTarget> {
    el.clickable_descendants
        .iter()
        .enumerate()
        .find(|(_, d)| {
            !d.in_menu && !is_transport(&d.ancestor_classes) && is_visible(&d.rect, &d.style, viewport)
        })
        .map(|(i, _)| ClickTarget::Descendant(i))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewport() -> Viewport {
        Viewport {
            width: 1280.0,
            height: 720.0,
        }
    }

    fn visible_rect() -> Rect {
        Rect {
            left: 100.0,
            top: 100.0,
            width: 120.0,
            height: 40.0,
        }
    }

    #[test]
    fn test_visible_accepts_half_faded_element() {
        let style = NodeStyle {
            opacity: 0.5,
            ..NodeStyle::plain()
        };
        assert!(is_visible(&visible_rect(), &style, &viewport()));
    }

    #[test]
    fn test_visible_rejects_zero_opacity() {
        let style = NodeStyle {
            opacity: 0.0,
            ..NodeStyle::plain()
        };
        assert!(!is_visible(&visible_rect(), &style, &viewport()));
    }

    #[test]
    fn test_visible_rejects_display_none() {
        let style = NodeStyle {
            display_none: true,
            ..NodeStyle::plain()
        };
        assert!(!is_visible(&visible_rect(), &style, &viewport()));
    }

    #[test]
    fn test_visible_rejects_zero_size() {
        let rect = Rect {
            width: 0.0,
            height: 0.0,
            ..visible_rect()
        };
        assert!(!is_visible(&rect, &NodeStyle::plain(), &viewport()));
    }

    #[test]
    fn test_visible_rejects_tiny_boxes() {
        let rect = Rect {
            width: 6.0,
            height: 6.0,
            ..visible_rect()
        };
        assert!(!is_visible(&rect, &NodeStyle::plain(), &viewport()));
    }

    #[test]
    fn test_visible_rejects_offscreen() {
        let rect = Rect {
            left: 2000.0,
            ..visible_rect()
        };
        assert!(!is_visible(&rect, &NodeStyle::plain(), &viewport()));
    }

    #[test]
    fn test_transport_detected_anywhere_in_chain() {
        let chain = vec![
            "PlayButton".to_string(),
            "TransportControls-wrapper".to_string(),
        ];
        assert!(is_transport(&chain));
        assert!(!is_transport(&["UpNextOverlay".to_string()]));
    }

    fn plain_button() -> ElementSnapshot {
        ElementSnapshot {
            tag: "button".into(),
            rect: visible_rect(),
            style: NodeStyle::plain(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_prefers_the_node_itself() {
        assert_eq!(resolve_clickable(&plain_button()), Some(ClickTarget::Own));
    }

    #[test]
    fn test_resolve_climbs_to_clickable_ancestor() {
        let el = ElementSnapshot {
            tag: "span".into(),
            style: NodeStyle {
                opacity: 1.0,
                ..Default::default()
            },
            ancestors: vec![
                AncestorSnapshot {
                    tag: "div".into(),
                    opacity: 1.0,
                    ..Default::default()
                },
                AncestorSnapshot {
                    tag: "div".into(),
                    role: "button".into(),
                    opacity: 1.0,
                    ..Default::default()
                },
            ],
            ancestor_classes: vec![String::new(); 3],
            ..Default::default()
        };
        assert_eq!(resolve_clickable(&el), Some(ClickTarget::Ancestor(1)));
    }

    #[test]
    fn test_resolve_stops_at_menu_boundary() {
        let el = ElementSnapshot {
            tag: "span".into(),
            ancestors: vec![
                AncestorSnapshot {
                    in_menu: true,
                    ..Default::default()
                },
                AncestorSnapshot {
                    tag: "button".into(),
                    opacity: 1.0,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        // The walk must not reach the button behind the menu boundary; the
        // node itself is the only remaining option.
        assert_eq!(resolve_clickable(&el), Some(ClickTarget::Own));
    }

    #[test]
    fn test_resolve_skips_transport_ancestor() {
        let el = ElementSnapshot {
            tag: "span".into(),
            ancestor_classes: vec![
                String::new(),
                "SeekBar-button".into(),
                "PlayerChrome".into(),
            ],
            ancestors: vec![
                AncestorSnapshot {
                    tag: "button".into(),
                    opacity: 1.0,
                    ..Default::default()
                },
                AncestorSnapshot {
                    tag: "div".into(),
                    opacity: 1.0,
                    cursor_pointer: true,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        // ancestors[0] sits under a Seek* class chain; ancestors[1] is clean.
        assert_eq!(resolve_clickable(&el), Some(ClickTarget::Ancestor(1)));
    }

    #[test]
    fn test_resolve_falls_back_to_descendant() {
        let el = ElementSnapshot {
            tag: "div".into(),
            in_menu: true,
            clickable_descendants: vec![DescendantSnapshot {
                tag: "button".into(),
                rect: visible_rect(),
                style: NodeStyle::plain(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(resolve_clickable(&el), Some(ClickTarget::Descendant(0)));
    }

    #[test]
    fn test_resolve_rejects_transport_node_outright() {
        let el = ElementSnapshot {
            tag: "button".into(),
            ancestor_classes: vec!["SkipForwardButton".into()],
            ..Default::default()
        };
        assert_eq!(resolve_clickable(&el), None);
    }

    #[test]
    fn test_scan_result_parses_probe_payload() {
        // Shape of the JSON the page bootstrap emits; field names are the
        // contract between inject.js and these types.
        let raw = r#"{
            "viewport": { "width": 1280, "height": 720 },
            "mutations": 42,
            "player_context": true,
            "candidates": [{
                "index": 0,
                "tag": "button",
                "role": "",
                "aria_label": "Play Next",
                "title_attr": "",
                "own_text": "Play Next",
                "near_text": "Up Next  My Show",
                "rect": { "left": 500, "top": 300, "width": 160, "height": 48 },
                "style": {
                    "display_none": false,
                    "visibility_hidden": false,
                    "opacity": 1,
                    "pointer_events_none": false,
                    "cursor_pointer": true
                },
                "has_onclick": false,
                "in_menu": false,
                "ancestor_classes": ["AudioVideoUpNext-playButton", "AudioVideoUpNext-overlay"],
                "ancestors": [{
                    "tag": "div",
                    "role": "",
                    "has_onclick": false,
                    "opacity": 1,
                    "pointer_events_none": false,
                    "cursor_pointer": false,
                    "in_menu": false
                }],
                "clickable_descendants": []
            }]
        }"#;
        let scan: ScanResult = serde_json::from_str(raw).unwrap();
        assert_eq!(scan.mutations, 42);
        assert!(scan.player_context);
        let el = &scan.candidates[0];
        assert_eq!(el.aria_label, "Play Next");
        assert!(el.is_visible(&scan.viewport));
        assert_eq!(resolve_clickable(el), Some(ClickTarget::Own));
    }

    #[test]
    fn test_video_state_parses_probe_payload() {
        let raw = r#"{
            "present": true, "paused": false, "ended": false, "ready_state": 4,
            "current_time": 810.5, "duration": 900, "volume": 0.7, "muted": false
        }"#;
        let v: VideoState = serde_json::from_str(raw).unwrap();
        assert!(v.is_playing());
        assert!((v.progress().unwrap() - 0.9006).abs() < 1e-3);
        assert!((v.remaining_secs() - 89.5).abs() < 1e-9);
    }

    #[test]
    fn test_pick_visible_descendant_requires_visibility() {
        let hidden = DescendantSnapshot {
            tag: "button".into(),
            rect: visible_rect(),
            style: NodeStyle {
                opacity: 0.0,
                ..NodeStyle::plain()
            },
            ..Default::default()
        };
        let shown = DescendantSnapshot {
            tag: "button".into(),
            rect: visible_rect(),
            style: NodeStyle::plain(),
            ..Default::default()
        };
        let el = ElementSnapshot {
            clickable_descendants: vec![hidden, shown],
            ..Default::default()
        };
        assert_eq!(
            pick_visible_descendant(&el, &viewport()),
            Some(ClickTarget::Descendant(1))
        );
    }
}
