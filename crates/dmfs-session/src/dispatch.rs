//! Event dispatch: dedup, coalescing, backpressure, enqueue, and the
//! synchronous reply wait.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{DmError, Result};
use crate::event::{Event, EventKind, EventSpec, Reply, Token};
use crate::interrupt::InterruptToken;
use crate::session::Session;
use crate::stats::EngineStats;
use crate::token::TokenAllocator;

/// Per-submission flags, mirroring the producer's calling context.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Block for a reply; the event carries a token.
    pub synchronous: bool,
    /// Never sleep: full queue or dedup hit fails instead of waiting,
    /// and a reply wait gives up once the event is marked intermediate.
    pub non_blocking: bool,
    /// Emergency path: skip backpressure entirely.
    pub forced: bool,
    /// External-signal hook for every blocking wait in this call.
    pub interrupt: Option<InterruptToken>,
}

impl DispatchOptions {
    fn interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(|t| t.is_raised())
    }
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    config: EngineConfig,
    tokens: TokenAllocator,
    stats: Arc<EngineStats>,
}

impl Dispatcher {
    pub(crate) fn new(config: EngineConfig, stats: Arc<EngineStats>) -> Self {
        Self {
            config,
            tokens: TokenAllocator::new(),
            stats,
        }
    }

    /// Accepts a populated event for `session` and sees it through to
    /// its outcome: queued (asynchronous), or replied/flushed
    /// (synchronous). Exactly one event is durably queued per accepted
    /// request.
    pub(crate) fn dispatch(
        &self,
        session: &Arc<Session>,
        spec: EventSpec,
        opts: &DispatchOptions,
    ) -> Result<Reply> {
        if !spec.kind.is_supported() {
            return Err(DmError::Unsupported { kind: spec.kind });
        }
        let kind = spec.kind;
        let event = Arc::new(Event::from_spec(spec));
        let mut state = session.state.lock();

        // Dedup / coalescing apply only to indexed data events.
        if let Some(key) = event.dedup_key {
            if let Some(existing) = state.dedup.get(&key).cloned() {
                if opts.non_blocking {
                    EngineStats::bump(&self.stats.duplicates_rejected);
                    return Err(DmError::Duplicate);
                }
                if opts.synchronous {
                    let mut existing_state = existing.state.lock();
                    if !existing_state.completed && existing_state.extra_waiters == 0 {
                        // Ride the in-flight event; our own copy is
                        // discarded and we share its eventual reply.
                        existing_state.extra_waiters += 1;
                        drop(existing_state);
                        drop(state);
                        EngineStats::bump(&self.stats.events_coalesced);
                        tracing::debug!(
                            "coalesced {:?} on session {}",
                            kind,
                            session.id()
                        );
                        return self.wait_as_extra(&existing, opts);
                    }
                }
            }
        }

        // Backpressure: park until the pending queue has room. The
        // event sits on the writer-wait queue so a flush can fail it.
        if !opts.forced && state.pending.len() >= self.config.max_pending_per_session {
            if opts.non_blocking {
                return Err(DmError::WouldBlock);
            }
            state.writerq.push_back(Arc::clone(&event));
            state.writers_waiting += 1;
            EngineStats::bump(&self.stats.writer_waits);
            let mut outcome: Option<Result<Reply>> = None;
            loop {
                {
                    let event_state = event.state.lock();
                    if event_state.completed {
                        // Flushed while parked.
                        outcome = Some(Ok(event_state.reply.unwrap_or(Reply::Continue)));
                        break;
                    }
                }
                if state.pending.len() < self.config.max_pending_per_session {
                    break;
                }
                if opts.interrupted() {
                    outcome = Some(Err(DmError::Interrupted));
                    break;
                }
                let _ = session
                    .writer_cv
                    .wait_for(&mut state, self.config.interrupt_poll);
            }
            state.writers_waiting -= 1;
            state.writerq.remove(&event);
            if let Some(result) = outcome {
                return result;
            }
        }

        // Stamp: next sequence always, next token only when the
        // producer will wait. The token lock is momentary.
        let (token, seq) = self.tokens.stamp(opts.synchronous);
        {
            let mut event_state = event.state.lock();
            event_state.token = token;
            event_state.seq = seq;
        }

        state.pending.push_back(Arc::clone(&event));
        state.index_event(&event);
        if state.readers_waiting > 0 {
            session.reader_cv.notify_one();
        }
        drop(state);
        EngineStats::bump(&self.stats.events_submitted);
        tracing::debug!(
            "queued {:?} seq={} token={} on session {}",
            kind,
            seq,
            token.as_u64(),
            session.id()
        );

        // Unmount is queued with a token but its producer is already
        // committed; it never waits.
        if !opts.synchronous || kind == EventKind::Unmount {
            return Ok(Reply::Continue);
        }

        self.wait_as_producer(&event, opts)
    }

    /// Always-accepted escalation path: stamp and queue, skipping
    /// dedup and backpressure, and return the token without waiting.
    pub(crate) fn enqueue_preformed(
        &self,
        session: &Arc<Session>,
        spec: EventSpec,
    ) -> Result<Token> {
        if !spec.kind.is_supported() {
            return Err(DmError::Unsupported { kind: spec.kind });
        }
        let event = Arc::new(Event::from_spec(spec));
        let (token, seq) = self.tokens.stamp(true);
        {
            let mut event_state = event.state.lock();
            event_state.token = token;
            event_state.seq = seq;
        }
        let mut state = session.state.lock();
        state.pending.push_back(Arc::clone(&event));
        state.index_event(&event);
        if state.readers_waiting > 0 {
            session.reader_cv.notify_one();
        }
        drop(state);
        EngineStats::bump(&self.stats.events_submitted);
        tracing::debug!(
            "queued preformed {:?} token={} on session {}",
            event.kind,
            token.as_u64(),
            session.id()
        );
        Ok(token)
    }

    /// Blocks the original producer until the event is resolved.
    fn wait_as_producer(&self, event: &Arc<Event>, opts: &DispatchOptions) -> Result<Reply> {
        let mut state = event.state.lock();
        state.producer_waiting = true;
        loop {
            if state.completed {
                state.producer_waiting = false;
                return Ok(state.reply.unwrap_or(Reply::Continue));
            }
            if opts.non_blocking && state.intermediate {
                // The application signalled a long-running response;
                // give up now, the event stays queued for a later wait.
                state.producer_waiting = false;
                return Err(DmError::WouldBlock);
            }
            if opts.interrupted() {
                state.producer_waiting = false;
                return Err(DmError::Interrupted);
            }
            let _ = event
                .reply_cv
                .wait_for(&mut state, self.config.interrupt_poll);
        }
    }

    /// Blocks a coalesced producer; the extra-waiter count was taken
    /// under the session lock before this is called.
    fn wait_as_extra(&self, event: &Arc<Event>, opts: &DispatchOptions) -> Result<Reply> {
        let mut state = event.state.lock();
        loop {
            if state.completed {
                state.extra_waiters -= 1;
                return Ok(state.reply.unwrap_or(Reply::Continue));
            }
            if opts.interrupted() {
                state.extra_waiters -= 1;
                return Err(DmError::Interrupted);
            }
            let _ = event
                .reply_cv
                .wait_for(&mut state, self.config.interrupt_poll);
        }
    }
}
