//! Per-port transaction tags for the arbiter.
//!
//! A port hands out at most `limit` local tags. Free tags live in a bounded
//! FIFO channel; the table of original requester tags is owned by the
//! port's response worker alone.

use tokio::sync::mpsc;

/// Maps allocated local tag → the requester's original tag bytes.
#[derive(Debug)]
pub struct TagTable {
    slots: Box<[Option<[u8; 2]>]>,
}

impl TagTable {
    pub fn new(limit: u8) -> Self {
        Self {
            slots: vec![None; limit as usize].into_boxed_slice(),
        }
    }

    /// Remember the original tag for an allocated tag. Returns any entry that
    /// was still live under the same tag, which means a tag was handed out
    /// twice.
    pub fn record(&mut self, tag: u8, original: [u8; 2]) -> Option<[u8; 2]> {
        self.slots
            .get_mut(tag as usize)
            .and_then(|slot| slot.replace(original))
    }

    /// Original tag for an allocated tag, if live.
    pub fn lookup(&self, tag: u8) -> Option<[u8; 2]> {
        self.slots.get(tag as usize).copied().flatten()
    }

    /// Forget an allocated tag, returning its original tag.
    pub fn release(&mut self, tag: u8) -> Option<[u8; 2]> {
        self.slots.get_mut(tag as usize).and_then(Option::take)
    }

    /// Number of live transactions.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Free-tag pool pre-filled with `0..limit`.
pub fn free_tags(limit: u8) -> (mpsc::Sender<u8>, mpsc::Receiver<u8>) {
    let (tx, rx) = mpsc::channel(limit.max(1) as usize);
    for tag in 0..limit {
        // Capacity equals the number of tags, so this always fits.
        let _ = tx.try_send(tag);
    }
    (tx, rx)
}
