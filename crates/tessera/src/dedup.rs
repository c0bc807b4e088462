use crate::types::{EntityId, MessageId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;

/// Per-sender record of processed message ids.
///
/// Remembers at most `window` ids per sender. Ids at or below `floor` were
/// evicted from the window and are reported as duplicates: a sender's ids are
/// strictly increasing, so anything that old was delivered long ago.
#[derive(Debug)]
struct SenderWindow {
    highest: i64,
    floor: i64,
    seen: BTreeSet<i64>,
}

/// Exactly-once filter over at-least-once delivery.
pub struct DuplicateSuppressor {
    senders: DashMap<EntityId, SenderWindow>,
    window: usize,
}

impl DuplicateSuppressor {
    pub fn new(window: usize) -> Self {
        Self {
            senders: DashMap::new(),
            window: window.max(1),
        }
    }

    /// Record `(sender, message_id)` and report whether it was seen before.
    pub fn already_processed(&self, sender: &EntityId, message_id: MessageId) -> bool {
        let id = message_id.0;
        let mut entry = match self.senders.entry(*sender) {
            Entry::Occupied(entry) => entry,
            Entry::Vacant(slot) => {
                slot.insert(SenderWindow {
                    highest: id,
                    floor: i64::MIN,
                    seen: BTreeSet::from([id]),
                });
                return false;
            }
        };
        let window = entry.get_mut();

        if id > window.highest {
            window.highest = id;
            window.seen.insert(id);
            self.trim(window);
            return false;
        }
        if id <= window.floor {
            return true;
        }
        if window.seen.insert(id) {
            self.trim(window);
            false
        } else {
            true
        }
    }

    fn trim(&self, window: &mut SenderWindow) {
        while window.seen.len() > self.window {
            if let Some(oldest) = window.seen.pop_first() {
                window.floor = window.floor.max(oldest);
            }
        }
    }

    /// Forget everything about `sender`.
    pub fn forget(&self, sender: &EntityId) {
        self.senders.remove(sender);
    }

    /// Highest id processed for `sender`.
    pub fn high_water_mark(&self, sender: &EntityId) -> Option<MessageId> {
        self.senders.get(sender).map(|w| MessageId(w.highest))
    }
}
