//! Per-shard cursor state
//!
//! [`ScanCursor`] is the whole mutable state of one shard's scan: position,
//! pinned node, first-batch snapshot. It is owned by exactly one shard task
//! and only touched between round-trips, so it needs no locking.
//!
//! Termination rules applied on every response:
//! - a returned cursor of 0 ends the scan (the store is done)
//! - a returned cursor equal to the one sent ends the scan (stall)
//! - a batch equal to the first non-empty batch seen at position 0 ends the
//!   scan without being emitted again (wrap-around)

use crate::error::{ScanError, ScanResult};
use crate::gateway::{NodeId, ScanBatch, ScanRequest, ShardRef, START_POSITION};

/// Where the cursor stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    /// Next round-trip goes out with this cursor
    At(u64),
    /// Nothing further to fetch
    Exhausted,
}

/// Why a cursor was exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// Store returned cursor 0
    Finished,
    /// Store returned the cursor it was given
    Stalled,
    /// First batch came round again
    Wrapped,
}

/// Outcome of applying one response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Keys to hand downstream
    Emit(Vec<String>),
    /// Scan wrapped back to its start; nothing to emit
    Wrapped,
}

/// Cursor for scanning one shard
#[derive(Debug, Clone)]
pub struct ScanCursor {
    shard: ShardRef,
    position: CursorPosition,
    pattern: String,
    batch_hint: usize,
    pinned: Option<NodeId>,
    first_batch: Option<Vec<String>>,
    exhaustion: Option<Exhaustion>,
    rounds: u64,
}

impl ScanCursor {
    pub fn new(shard: ShardRef, pattern: impl Into<String>, batch_hint: usize) -> Self {
        Self {
            shard,
            position: CursorPosition::At(START_POSITION),
            pattern: pattern.into(),
            batch_hint,
            pinned: None,
            first_batch: None,
            exhaustion: None,
            rounds: 0,
        }
    }

    pub fn shard(&self) -> &ShardRef {
        &self.shard
    }

    pub fn position(&self) -> CursorPosition {
        self.position
    }

    /// Node every round-trip after the first must go to
    pub fn pinned_node(&self) -> Option<&NodeId> {
        self.pinned.as_ref()
    }

    /// Responses applied so far
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn is_exhausted(&self) -> bool {
        self.position == CursorPosition::Exhausted
    }

    pub fn exhaustion(&self) -> Option<Exhaustion> {
        self.exhaustion
    }

    /// The next round-trip, or None once exhausted
    pub fn request(&self) -> Option<ScanRequest> {
        match self.position {
            CursorPosition::At(position) => Some(ScanRequest {
                shard: self.shard.clone(),
                node: self.pinned.clone(),
                position,
                pattern: self.pattern.clone(),
                batch_hint: self.batch_hint,
            }),
            CursorPosition::Exhausted => None,
        }
    }

    /// Apply the response to the round-trip built by [`request`](Self::request)
    pub fn advance(&mut self, batch: ScanBatch) -> ScanResult<Advance> {
        let requested = match self.position {
            CursorPosition::At(position) => position,
            CursorPosition::Exhausted => {
                return Err(self.protocol("response arrived after the cursor was exhausted".into()))
            }
        };

        match &self.pinned {
            None => self.pinned = Some(batch.responding_node.clone()),
            Some(node) if *node != batch.responding_node => {
                return Err(self.protocol(format!(
                    "cursor pinned to '{}' was answered by '{}'",
                    node, batch.responding_node
                )));
            }
            Some(_) => {}
        }

        self.rounds += 1;
        let ScanBatch {
            values,
            next_position,
            ..
        } = batch;

        if requested == START_POSITION && self.first_batch.is_none() {
            if !values.is_empty() {
                self.first_batch = Some(values.clone());
            }
        } else if self.first_batch.as_ref() == Some(&values) {
            self.exhaust(Exhaustion::Wrapped);
            return Ok(Advance::Wrapped);
        }

        if next_position == START_POSITION {
            self.exhaust(Exhaustion::Finished);
        } else if next_position == requested {
            self.exhaust(Exhaustion::Stalled);
        } else {
            self.position = CursorPosition::At(next_position);
        }

        Ok(Advance::Emit(values))
    }

    fn exhaust(&mut self, why: Exhaustion) {
        self.position = CursorPosition::Exhausted;
        self.exhaustion = Some(why);
    }

    fn protocol(&self, reason: String) -> ScanError {
        ScanError::Protocol {
            shard: self.shard.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(next: u64, values: &[&str]) -> ScanBatch {
        ScanBatch {
            values: values.iter().map(|v| v.to_string()).collect(),
            next_position: next,
            responding_node: NodeId::new("node-a"),
        }
    }

    fn cursor() -> ScanCursor {
        ScanCursor::new(ShardRef::new("shard"), "*", 2)
    }

    #[test]
    fn test_walk_to_finish() {
        let mut c = cursor();
        assert_eq!(c.request().unwrap().position, 0);

        assert_eq!(c.advance(batch(5, &["a", "b"])).unwrap(), Advance::Emit(vec!["a".into(), "b".into()]));
        assert_eq!(c.position(), CursorPosition::At(5));

        assert_eq!(c.advance(batch(9, &["c", "d"])).unwrap(), Advance::Emit(vec!["c".into(), "d".into()]));
        assert_eq!(c.advance(batch(0, &["e"])).unwrap(), Advance::Emit(vec!["e".into()]));

        assert!(c.is_exhausted());
        assert_eq!(c.exhaustion(), Some(Exhaustion::Finished));
        assert!(c.request().is_none());
        assert_eq!(c.rounds(), 3);
    }

    #[test]
    fn test_repeat_of_first_batch_wraps() {
        let mut c = cursor();
        c.advance(batch(3, &["a", "b"])).unwrap();

        // Same cursor and same batch: wrap is detected before the stall
        assert_eq!(c.advance(batch(3, &["a", "b"])).unwrap(), Advance::Wrapped);
        assert_eq!(c.exhaustion(), Some(Exhaustion::Wrapped));
    }

    #[test]
    fn test_stalled_cursor_exhausts() {
        let mut c = cursor();
        c.advance(batch(3, &["a", "b"])).unwrap();

        assert_eq!(c.advance(batch(3, &["c"])).unwrap(), Advance::Emit(vec!["c".into()]));
        assert_eq!(c.exhaustion(), Some(Exhaustion::Stalled));
    }

    #[test]
    fn test_wrap_later_in_scan() {
        let mut c = cursor();
        c.advance(batch(4, &["a", "b"])).unwrap();
        c.advance(batch(8, &["c"])).unwrap();

        assert_eq!(c.advance(batch(12, &["a", "b"])).unwrap(), Advance::Wrapped);
    }

    #[test]
    fn test_empty_first_batch_is_not_a_baseline() {
        let mut c = cursor();
        c.advance(batch(4, &[])).unwrap();

        // A later empty batch must not look like a wrap
        assert_eq!(c.advance(batch(8, &[])).unwrap(), Advance::Emit(vec![]));
        assert_eq!(c.position(), CursorPosition::At(8));
    }

    #[test]
    fn test_node_affinity() {
        let mut c = cursor();
        assert!(c.request().unwrap().node.is_none());

        c.advance(batch(4, &["a"])).unwrap();
        assert_eq!(c.pinned_node(), Some(&NodeId::new("node-a")));
        assert_eq!(c.request().unwrap().node, Some(NodeId::new("node-a")));

        let mut moved = batch(8, &["b"]);
        moved.responding_node = NodeId::new("node-b");
        let err = c.advance(moved).unwrap_err();
        assert!(matches!(err, ScanError::Protocol { .. }));

        // Affinity is unchanged by the rejected response
        assert_eq!(c.pinned_node(), Some(&NodeId::new("node-a")));
    }

    #[test]
    fn test_response_after_exhaustion_is_rejected() {
        let mut c = cursor();
        c.advance(batch(0, &["a"])).unwrap();
        assert!(c.advance(batch(0, &["b"])).is_err());
    }
}
