use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Stable per-show identity derived from noisy page titles.
/// Never stored as source of truth; recomputed whenever the page title moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesIdentity {
    pub display_title: String,
    pub canonical_key: String,
}

impl SeriesIdentity {
    pub fn unknown() -> Self {
        SeriesIdentity {
            display_title: "Unknown".into(),
            canonical_key: String::new(),
        }
    }

    /// Resolve identity from the probe's title sources: a player metadata
    /// element when present, otherwise the document title with branding
    /// stripped.
    pub fn resolve(metadata_title: Option<&str>, document_title: &str) -> Self {
        let display = match metadata_title.map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => infer_from_document_title(document_title),
        };
        let canonical_key = series_key(&display);
        SeriesIdentity {
            display_title: display,
            canonical_key,
        }
    }
}

// Episode-marker suffixes, tried in order. Each is anchored to the end of the
// title; the broader mid-string forms swallow any trailing extras too.
static RE_DASH_SNEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*[-\u{2013}\u{2014}]\s*S\d+\s*[\u{00B7}x\u{00D7}]?\s*E\d+\s*$").unwrap());
static RE_PAREN_SNEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*\(\s*S\d+\s*[\u{00B7}x\u{00D7}]?\s*E\d+\s*\)\s*$").unwrap());
static RE_SEASON_EPISODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*\bS(?:eason)?\s*\d+\s*[\u{00B7}x\u{00D7}.]?\s*E(?:pisode)?\s*\d+\b.*$").unwrap()
});
static RE_BARE_SNEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*\bS\d+\s*E\d+\b.*$").unwrap());
static RE_DASH_SEASON_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*[-\u{2013}\u{2014}]\s*Season\s*\d+\s*Episode\s*\d+\s*$").unwrap()
});
static RE_SEASON_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*\bSeason\s*\d+\s*Episode\s*\d+\b.*$").unwrap());
static RE_NXN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:[-\u{2013}\u{2014}]\s*)?\(?\s*\b\d{1,2}\s*[x\u{00D7}]\s*\d{1,4}\)?\s*$").unwrap()
});

static RE_NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s]+").unwrap());
static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Strip trailing season/episode markers ("- S2E5", "(S02E05)", "S2·E5 Extra",
/// "Season 1 Episode 3", "1x01") from the end of a title.
pub fn canonicalize(title: &str) -> String {
    let mut t = title.trim().to_string();
    for re in [
        &*RE_DASH_SNEN,
        &*RE_PAREN_SNEN,
        &*RE_SEASON_EPISODE,
        &*RE_BARE_SNEN,
        &*RE_DASH_SEASON_WORDS,
        &*RE_SEASON_WORDS,
        &*RE_NXN,
    ] {
        t = re.replace(&t, "").into_owned();
    }
    t.trim().to_string()
}

/// Lowercase, strip everything that is not a letter/number/space, collapse
/// whitespace. Punctuation-only differences between titles vanish here.
pub fn normalize(title: &str) -> String {
    let lowered = title.to_lowercase();
    let stripped = RE_NON_WORD.replace_all(&lowered, "");
    RE_WHITESPACE.replace_all(&stripped, " ").trim().to_string()
}

/// The stable lookup key for per-show rules.
pub fn series_key(title: &str) -> String {
    normalize(&canonicalize(title))
}

/// Best-effort series title from a document title like
/// "Ep 3 • My Show — Streaming Site": drop the branding after the em-dash,
/// then keep the last bullet-separated segment.
fn infer_from_document_title(doc_title: &str) -> String {
    let t = doc_title.trim();
    if t.is_empty() {
        return "Unknown".into();
    }
    let left = t.split('\u{2014}').next().unwrap_or(t).trim();
    let series = left.rsplit('\u{2022}').next().unwrap_or(left).trim();
    if series.is_empty() {
        return "Unknown".into();
    }
    series.chars().take(80).collect()
}
