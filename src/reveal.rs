use serde::{Deserialize, Serialize};

/// Attribute values captured before a force-reveal touches a node.
/// `None` means the attribute was absent and must be removed again on
/// restore; `Some("")` is a present-but-empty attribute and stays distinct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavedAttrs {
    pub style: Option<String>,
    pub class: Option<String>,
    pub aria_hidden: Option<String>,
}

/// Ledger for one force-reveal cycle: the registry index it addressed and
/// the original attributes of every touched node (overlay container, the
/// button, the button's parent — in touch order). The restore payload is the
/// recorded originals, verbatim, and is sent whether or not the click
/// landed.
#[derive(Debug, Clone)]
pub struct RevealTicket {
    pub index: usize,
    saved: Vec<SavedAttrs>,
}

impl RevealTicket {
    pub fn new(index: usize, saved: Vec<SavedAttrs>) -> Self {
        RevealTicket { index, saved }
    }

    /// The exact attribute set to hand back to the page for restoration.
    pub fn restore_payload(&self) -> &[SavedAttrs] {
        &self.saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<SavedAttrs> {
        vec![
            SavedAttrs {
                style: Some("opacity: 0; transition: opacity 200ms".into()),
                class: Some("AudioVideoUpNext-overlay hidden".into()),
                aria_hidden: Some("true".into()),
            },
            SavedAttrs {
                style: None,
                class: Some(String::new()),
                aria_hidden: None,
            },
            SavedAttrs::default(),
        ]
    }

    #[test]
    fn test_restore_payload_is_byte_exact() {
        let saved = sample();
        let ticket = RevealTicket::new(3, saved.clone());
        assert_eq!(ticket.restore_payload(), saved.as_slice());
    }

    #[test]
    fn test_payload_survives_json_round_trip() {
        // The attrs travel page → engine → page as JSON; absent (null) and
        // empty ("") must stay distinguishable or restore would corrupt the
        // host's state.
        let saved = sample();
        let json = serde_json::to_string(&saved).unwrap();
        let back: Vec<SavedAttrs> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, saved);
        assert!(json.contains("null"));
        assert!(json.contains(r#""class":"""#));
    }

    #[test]
    fn test_ticket_is_immutable_across_click_outcomes() {
        // Whatever happened between reveal and restore, the payload is the
        // recording, not current DOM state.
        let ticket = RevealTicket::new(0, sample());
        let before = ticket.restore_payload().to_vec();
        // (a click attempt happens here in real use)
        assert_eq!(ticket.restore_payload(), before.as_slice());
    }
}
