//! Conversation sessions.
//!
//! A session belongs to one snapshot and one owner. Turns are only ever
//! appended; a session can be cleared as a whole but a turn is never
//! rewritten.

use serde::{Deserialize, Serialize};

/// One question/answer exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Zero-based position in the session.
    pub index: u32,
    pub question: String,
    /// What went into the context block, e.g. "1 turns, 3 chunks, ...".
    pub context_summary: String,
    pub answer: String,
    /// Chunks that were actually placed in the prompt.
    pub used_chunk_ids: Vec<String>,
    /// Unix timestamp.
    pub asked_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSession {
    pub id: String,
    pub snapshot_id: String,
    pub owner: String,
    turns: Vec<ConversationTurn>,
}

impl ConversationSession {
    pub fn new(id: impl Into<String>, snapshot_id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            snapshot_id: snapshot_id.into(),
            owner: owner.into(),
            turns: Vec::new(),
        }
    }

    /// Rebuild a session from persisted turns, ordering them by index.
    pub fn from_turns(
        id: impl Into<String>,
        snapshot_id: impl Into<String>,
        owner: impl Into<String>,
        mut turns: Vec<ConversationTurn>,
    ) -> Self {
        turns.sort_by_key(|t| t.index);
        Self {
            turns,
            ..Self::new(id, snapshot_id, owner)
        }
    }

    /// Append a turn and return it. The index is assigned here.
    pub fn append(
        &mut self,
        question: impl Into<String>,
        context_summary: impl Into<String>,
        answer: impl Into<String>,
        used_chunk_ids: Vec<String>,
        asked_at: i64,
    ) -> &ConversationTurn {
        let turn = ConversationTurn {
            index: self.next_index(),
            question: question.into(),
            context_summary: context_summary.into(),
            answer: answer.into(),
            used_chunk_ids,
            asked_at,
        };
        self.turns.push(turn);
        &self.turns[self.turns.len() - 1]
    }

    pub fn next_index(&self) -> u32 {
        self.turns.last().map(|t| t.index + 1).unwrap_or(0)
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// The last `n` turns, chronological.
    pub fn recent(&self, n: usize) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_indices() {
        let mut s = ConversationSession::new("s1", "snap", "local");
        assert!(s.is_empty());
        s.append("q0", "", "a0", vec![], 1);
        let t = s.append("q1", "1 turns", "a1", vec!["c1".into()], 2);
        assert_eq!(t.index, 1);
        assert_eq!(t.used_chunk_ids, vec!["c1".to_string()]);
        assert_eq!(s.len(), 2);
        assert_eq!(s.next_index(), 2);
    }

    #[test]
    fn test_recent_is_chronological_tail() {
        let mut s = ConversationSession::new("s1", "snap", "local");
        for i in 0..5 {
            s.append(format!("q{}", i), "", "a", vec![], i);
        }
        let recent: Vec<&str> = s.recent(2).iter().map(|t| t.question.as_str()).collect();
        assert_eq!(recent, vec!["q3", "q4"]);
        assert_eq!(s.recent(10).len(), 5);
        assert!(s.recent(0).is_empty());
    }

    #[test]
    fn test_from_turns_orders_by_index() {
        let mut s = ConversationSession::new("s1", "snap", "local");
        s.append("first", "", "a", vec![], 1);
        s.append("second", "", "b", vec![], 2);
        let mut turns = s.turns().to_vec();
        turns.reverse();

        let rebuilt = ConversationSession::from_turns("s1", "snap", "local", turns);
        assert_eq!(rebuilt, s);
        assert_eq!(rebuilt.next_index(), 2);
    }
}
