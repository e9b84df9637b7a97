//! Deterministic FIFO turn queue, ordered by `ingressSeq` (§4.2).
//!
//! The queue itself offers no concurrency guarantees — the session manager
//! serializes all access to a given session's queue from within its single
//! logical actor (§5).

use std::collections::VecDeque;

use sd_domain::model::Turn;

#[derive(Default)]
pub struct TurnQueue {
    turns: VecDeque<Turn>,
}

impl TurnQueue {
    pub fn new() -> Self {
        Self { turns: VecDeque::new() }
    }

    /// Insert in `ingressSeq` order. Turns are submitted with a
    /// process-wide monotonically increasing `ingressSeq`, so the common
    /// case is an append at the tail (O(1)); the scan-from-tail fallback
    /// keeps the queue correctly ordered even if that assumption is ever
    /// violated.
    pub fn enqueue(&mut self, turn: Turn) {
        let pos = self
            .turns
            .iter()
            .rposition(|t| t.ingress_seq <= turn.ingress_seq)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.turns.insert(pos, turn);
    }

    pub fn dequeue(&mut self) -> Option<Turn> {
        self.turns.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Remove the turn with the given turn ID, if queued. Returns it.
    pub fn cancel_by_turn_id(&mut self, turn_id: &str) -> Option<Turn> {
        let idx = self.turns.iter().position(|t| t.turn_id == turn_id)?;
        self.turns.remove(idx)
    }

    /// Remove every queued turn from `writer_id`. Returns how many were
    /// removed.
    pub fn cancel_by_writer(&mut self, writer_id: &str) -> Vec<Turn> {
        let mut removed = Vec::new();
        self.turns.retain(|t| {
            if t.writer_id == writer_id {
                removed.push(t.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sd_domain::model::TurnMode;

    fn turn(turn_id: &str, ingress_seq: u64, writer_id: &str) -> Turn {
        Turn {
            turn_id: turn_id.into(),
            ingress_seq,
            session_id: "s1".into(),
            client_id: "c1".into(),
            writer_id: writer_id.into(),
            content: "hi".into(),
            mode: TurnMode::Chat,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn dequeue_order_matches_ingress_seq_order() {
        let mut q = TurnQueue::new();
        q.enqueue(turn("t2", 2, "w"));
        q.enqueue(turn("t1", 1, "w"));
        q.enqueue(turn("t3", 3, "w"));
        assert_eq!(q.dequeue().unwrap().turn_id, "t1");
        assert_eq!(q.dequeue().unwrap().turn_id, "t2");
        assert_eq!(q.dequeue().unwrap().turn_id, "t3");
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn cancel_by_turn_id_removes_only_that_turn() {
        let mut q = TurnQueue::new();
        q.enqueue(turn("t1", 1, "w1"));
        q.enqueue(turn("t2", 2, "w1"));
        let removed = q.cancel_by_turn_id("t1").unwrap();
        assert_eq!(removed.turn_id, "t1");
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue().unwrap().turn_id, "t2");
    }

    #[test]
    fn cancel_by_writer_removes_all_matching() {
        let mut q = TurnQueue::new();
        q.enqueue(turn("t1", 1, "w1"));
        q.enqueue(turn("t2", 2, "w2"));
        q.enqueue(turn("t3", 3, "w1"));
        let removed = q.cancel_by_writer("w1");
        assert_eq!(removed.len(), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue().unwrap().turn_id, "t2");
    }

    #[test]
    fn cancel_by_turn_id_unknown_returns_none() {
        let mut q = TurnQueue::new();
        q.enqueue(turn("t1", 1, "w1"));
        assert!(q.cancel_by_turn_id("nope").is_none());
        assert_eq!(q.len(), 1);
    }
}
