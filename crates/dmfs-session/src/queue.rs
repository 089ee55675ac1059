//! Ordered FIFO of event handles.
//!
//! One instance per queue (pending, delivered, writer-wait); an event's
//! membership is tracked by handle identity, so a single event can never
//! be threaded onto two queues through a shared link.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::event::{Event, Token};

/// FIFO of shared event handles. Insertion order is delivery order.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    items: VecDeque<Arc<Event>>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn push_back(&mut self, event: Arc<Event>) {
        self.items.push_back(event);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Event>> {
        self.items.iter()
    }

    /// Unlinks `event` if present. Returns false when another path
    /// (e.g. a flush) already removed it.
    pub(crate) fn remove(&mut self, event: &Arc<Event>) -> bool {
        if let Some(pos) = self.items.iter().position(|e| Arc::ptr_eq(e, event)) {
            self.items.remove(pos);
            true
        } else {
            false
        }
    }

    /// Finds the entry holding `token`, if any.
    pub(crate) fn find_token(&self, token: Token) -> Option<Arc<Event>> {
        self.items
            .iter()
            .find(|e| e.token() == token)
            .cloned()
    }
}
