//! Event-name interning.

use std::collections::HashMap;

/// Dense identifier of an interned event name, assigned in first-seen order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u32);

/// Append-only table mapping event names to dense ids.
#[derive(Debug, Default)]
pub struct EventIndex {
    names: Vec<String>,
    ids: HashMap<String, EventId>,
}

impl EventIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id of `name`, assigning the next one if it is new.
    pub fn intern(&mut self, name: &str) -> EventId {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = EventId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    /// Look up an id without interning.
    pub fn get(&self, name: &str) -> Option<EventId> {
        self.ids.get(name).copied()
    }

    /// Reverse lookup.
    pub fn name(&self, id: EventId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
