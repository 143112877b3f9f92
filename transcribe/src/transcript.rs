//! Transcript segments surfaced by the transcription service.

use serde::{Deserialize, Serialize};

/// Token classification within a transcript segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Pronunciation,
    Punctuation,
    Unknown,
}

/// One token of a transcript segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptItem {
    pub content: String,
    pub start_time_s: Option<f64>,
    pub end_time_s: Option<f64>,
    pub kind: ItemKind,
}

/// A transcript segment. Produced by the transcription service and not
/// mutated once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub session_id: String,
    pub text: String,
    /// Partial segments are superseded by later revisions; final ones
    /// are stable.
    pub is_partial: bool,
    pub start_time_s: Option<f64>,
    pub end_time_s: Option<f64>,
    pub result_id: Option<String>,
    pub items: Vec<TranscriptItem>,
    pub sequence: u64,
    /// Wall-clock time the segment was received, in milliseconds.
    pub received_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_roundtrips_through_json() {
        let transcript = Transcript {
            session_id: "s-1".into(),
            text: "hello world.".into(),
            is_partial: false,
            start_time_s: Some(0.2),
            end_time_s: Some(1.4),
            result_id: Some("r-9".into()),
            items: vec![
                TranscriptItem {
                    content: "hello".into(),
                    start_time_s: Some(0.2),
                    end_time_s: Some(0.6),
                    kind: ItemKind::Pronunciation,
                },
                TranscriptItem {
                    content: ".".into(),
                    start_time_s: None,
                    end_time_s: None,
                    kind: ItemKind::Punctuation,
                },
            ],
            sequence: 7,
            received_at_ms: 1_700_000_000_000,
        };

        let json = serde_json::to_string(&transcript).unwrap();
        let back: Transcript = serde_json::from_str(&json).unwrap();
        assert_eq!(back.text, transcript.text);
        assert_eq!(back.items.len(), 2);
        assert_eq!(back.items[1].kind, ItemKind::Punctuation);
        assert!(!back.is_partial);
    }
}
