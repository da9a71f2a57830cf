//! Puffer für lokale ICE Candidates
//!
//! Candidates werden gesammelt bis eine Remote Description installiert ist
//! und dann genau einmal in Erzeugungsreihenfolge verschickt. Danach gehen
//! neue Candidates direkt raus.

/// Lokale ICE Candidates einer Session
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<String>,
    flushed: bool,
    discarded: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nimmt einen neuen Candidate an
    ///
    /// Gibt den Candidate zurück, wenn er sofort verschickt werden soll
    /// (Puffer bereits geleert), sonst `None`.
    pub fn push(&mut self, candidate: String) -> Option<String> {
        if self.discarded {
            return None;
        }
        if self.flushed {
            return Some(candidate);
        }
        self.pending.push(candidate);
        None
    }

    /// Leert den Puffer, nur der erste Aufruf liefert Candidates
    pub fn flush(&mut self) -> Vec<String> {
        if self.flushed || self.discarded {
            return Vec::new();
        }
        self.flushed = true;
        std::mem::take(&mut self.pending)
    }

    /// Verwirft alle Candidates (Teardown), weitere werden ignoriert
    pub fn discard(&mut self) {
        self.discarded = true;
        self.pending.clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_until_flush_in_order() {
        let mut buffer = CandidateBuffer::new();
        assert_eq!(buffer.push("c1".to_string()), None);
        assert_eq!(buffer.push("c2".to_string()), None);
        assert_eq!(buffer.push("c3".to_string()), None);

        assert_eq!(buffer.flush(), vec!["c1", "c2", "c3"]);
        assert_eq!(buffer.push("c4".to_string()), Some("c4".to_string()));
    }

    #[test]
    fn test_second_flush_sends_nothing() {
        let mut buffer = CandidateBuffer::new();
        buffer.push("c1".to_string());
        assert_eq!(buffer.flush().len(), 1);
        assert!(buffer.flush().is_empty());
    }

    #[test]
    fn test_candidates_after_flush_pass_through() {
        let mut buffer = CandidateBuffer::new();
        buffer.flush();
        assert_eq!(buffer.push("late".to_string()), Some("late".to_string()));
        assert!(buffer.flush().is_empty());
    }

    #[test]
    fn test_discard_drops_everything() {
        let mut buffer = CandidateBuffer::new();
        buffer.push("c1".to_string());
        buffer.discard();
        assert!(buffer.flush().is_empty());
        assert_eq!(buffer.push("c2".to_string()), None);
        assert!(buffer.flush().is_empty());
    }
}
