//! Global token and sequence allocation.

use parking_lot::Mutex;

use crate::event::Token;

#[derive(Debug)]
struct Counters {
    next_token: u64,
    next_seq: u64,
}

/// Single engine-wide monotonic allocator. Its lock is held only for
/// the increment, never across a wait.
#[derive(Debug)]
pub(crate) struct TokenAllocator {
    counters: Mutex<Counters>,
}

impl TokenAllocator {
    pub(crate) fn new() -> Self {
        Self {
            counters: Mutex::new(Counters {
                next_token: 1,
                next_seq: 1,
            }),
        }
    }

    /// Stamps a new event: always the next sequence number, and the next
    /// token only for synchronous kinds (asynchronous events carry the
    /// sentinel).
    pub(crate) fn stamp(&self, synchronous: bool) -> (Token, u64) {
        let mut c = self.counters.lock();
        let seq = c.next_seq;
        c.next_seq += 1;
        let token = if synchronous {
            let t = c.next_token;
            c.next_token += 1;
            Token(t)
        } else {
            Token::NONE
        };
        (token, seq)
    }
}
