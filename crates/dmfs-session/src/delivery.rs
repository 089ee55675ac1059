//! Consumer-facing delivery: reading events, replying, relocating, and
//! flagging long-running responses.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{DmError, Result};
use crate::event::{Disposition, EventKind, EventRecord, Reply, Token};
use crate::interrupt::InterruptToken;
use crate::session::Session;
use crate::stats::EngineStats;

/// Blocking-behavior flags for consumer calls.
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Fail with `WouldBlock` instead of sleeping.
    pub non_blocking: bool,
    /// External-signal hook for the sleep, if any.
    pub interrupt: Option<InterruptToken>,
}

impl WaitOptions {
    fn interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(|t| t.is_raised())
    }
}

#[derive(Debug)]
pub(crate) struct Delivery {
    config: EngineConfig,
    stats: Arc<EngineStats>,
}

impl Delivery {
    pub(crate) fn new(config: EngineConfig, stats: Arc<EngineStats>) -> Self {
        Self { config, stats }
    }

    /// Pulls up to `max_events` unclaimed pending events, charging each
    /// one's serialized size against `max_bytes`. Returns the batch
    /// collected so far when the next event would overflow the buffer;
    /// fails `TooBig` only when not even the first event fits.
    pub(crate) fn get_events(
        &self,
        session: &Arc<Session>,
        max_events: usize,
        max_bytes: usize,
        opts: &WaitOptions,
    ) -> Result<Vec<EventRecord>> {
        if max_events == 0 {
            return Err(DmError::invalid("max_events must be positive"));
        }
        let mut out = Vec::new();
        let mut used = 0usize;
        let mut state = session.state.lock();
        loop {
            let next = state
                .pending
                .iter()
                .find(|e| {
                    let event_state = e.state.lock();
                    !event_state.claimed && !event_state.completed
                })
                .cloned();
            let Some(event) = next else {
                if !out.is_empty() {
                    break;
                }
                if opts.non_blocking {
                    return Err(DmError::WouldBlock);
                }
                state.readers_waiting += 1;
                EngineStats::bump(&self.stats.reader_waits);
                loop {
                    if opts.interrupted() {
                        state.readers_waiting -= 1;
                        return Err(DmError::Interrupted);
                    }
                    let _ = session
                        .reader_cv
                        .wait_for(&mut state, self.config.interrupt_poll);
                    if !state.pending.is_empty() {
                        break;
                    }
                }
                state.readers_waiting -= 1;
                continue;
            };

            // Claim: from here no other consumer may deliver this
            // event, and serialization runs without the session lock.
            event.state.lock().claimed = true;
            drop(state);
            let record = event.record();
            let size = bincode::serialized_size(&record);
            // The claim must not outlive this call, or the event would
            // be undeliverable forever.
            state = session.state.lock();
            event.state.lock().claimed = false;
            let size = size
                .map_err(|e| DmError::invalid(format!("event serialization failed: {e}")))?
                as usize;

            if used + size > max_bytes {
                if out.is_empty() {
                    return Err(DmError::TooBig {
                        needed: size,
                        capacity: max_bytes,
                    });
                }
                // Leave it queued and unclaimed for the next call.
                break;
            }

            if !state.pending.remove(&event) {
                // A flush unlinked it while we were serializing.
                continue;
            }
            if record.token.is_valid() {
                // Synchronous: now reachable by token for the reply.
                state.delivered.push_back(Arc::clone(&event));
            } else {
                // Asynchronous: no reply will ever arrive; finalize.
                state.unindex_event(&event);
                event.complete(Reply::Continue, false);
            }
            if state.writers_waiting > 0 {
                session.writer_cv.notify_one();
            }
            EngineStats::bump(&self.stats.events_delivered);
            tracing::debug!(
                "delivered {:?} token={} from session {}",
                record.kind,
                record.token.as_u64(),
                session.id()
            );
            used += size;
            out.push(record);
            if out.len() >= max_events {
                break;
            }
        }
        Ok(out)
    }

    /// Applies the application's disposition to a delivered event and
    /// wakes the producer plus any coalesced waiters. Succeeds at most
    /// once per token; the entry leaves the delivered queue here.
    pub(crate) fn respond_event(
        &self,
        session: &Arc<Session>,
        token: Token,
        disposition: Disposition,
        errno: i32,
    ) -> Result<()> {
        let reply = match disposition {
            Disposition::Continue => {
                if errno != 0 {
                    return Err(DmError::invalid("Continue carries no error code"));
                }
                Reply::Continue
            }
            Disposition::Abort => {
                if errno <= 0 {
                    return Err(DmError::invalid("Abort requires a positive error code"));
                }
                Reply::Abort(errno)
            }
            Disposition::DontCare => Reply::DontCare,
        };
        if !token.is_valid() {
            return Err(DmError::NotFound);
        }
        let mut state = session.state.lock();
        let event = state.find_delivered(token).ok_or(DmError::NotFound)?;
        if disposition == Disposition::DontCare && event.kind != EventKind::Mount {
            return Err(DmError::invalid(
                "DontCare is legal only for Mount events",
            ));
        }
        state.delivered.remove(&event);
        state.unindex_event(&event);
        drop(state);
        event.complete(reply, false);
        EngineStats::bump(&self.stats.events_replied);
        tracing::debug!(
            "replied {:?} errno={} to token={} on session {}",
            disposition,
            errno,
            token.as_u64(),
            session.id()
        );
        Ok(())
    }

    /// Atomically relocates a delivered entry, including its duplicate
    /// index membership, from `src` to `dst`.
    pub(crate) fn move_event(
        &self,
        src: &Arc<Session>,
        token: Token,
        dst: &Arc<Session>,
    ) -> Result<()> {
        if src.id() == dst.id() {
            let state = src.state.lock();
            return state
                .find_delivered(token)
                .map(|_| ())
                .ok_or(DmError::NotFound);
        }
        // Two session locks: take them in ascending id order. Either
        // way the tuple binds as (source, destination).
        let (mut src_state, mut dst_state) = if src.id() < dst.id() {
            let a = src.state.lock();
            let b = dst.state.lock();
            (a, b)
        } else {
            let b = dst.state.lock();
            let a = src.state.lock();
            (a, b)
        };
        let event = src_state.find_delivered(token).ok_or(DmError::NotFound)?;
        src_state.delivered.remove(&event);
        src_state.unindex_event(&event);
        dst_state.delivered.push_back(Arc::clone(&event));
        dst_state.index_event(&event);
        tracing::debug!(
            "moved token={} from session {} to session {}",
            token.as_u64(),
            src.id(),
            dst.id()
        );
        Ok(())
    }

    /// Marks a delivered event intermediate and wakes its waiters so a
    /// non-blocking producer can give up early.
    pub(crate) fn pending(&self, session: &Arc<Session>, token: Token) -> Result<()> {
        let state = session.state.lock();
        let event = state.find_delivered(token).ok_or(DmError::NotFound)?;
        drop(state);
        event.state.lock().intermediate = true;
        event.reply_cv.notify_all();
        Ok(())
    }

    /// Copies out an event by token, searching delivered then pending.
    pub(crate) fn find_event(&self, session: &Arc<Session>, token: Token) -> Result<EventRecord> {
        if !token.is_valid() {
            return Err(DmError::NotFound);
        }
        let state = session.state.lock();
        let event = state
            .find_delivered(token)
            .or_else(|| state.pending.find_token(token))
            .ok_or(DmError::NotFound)?;
        drop(state);
        Ok(event.record())
    }

    /// Tokens of all delivered (outstanding) events, oldest first.
    pub(crate) fn list_tokens(&self, session: &Arc<Session>) -> Vec<Token> {
        let state = session.state.lock();
        state.delivered.iter().map(|e| e.token()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchOptions, Dispatcher};
    use crate::event::{EventSpec, FsId, ObjectRef};
    use crate::session::SessionId;
    use std::thread;

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        delivery: Arc<Delivery>,
        session: Arc<Session>,
    }

    fn setup() -> Fixture {
        let stats = Arc::new(EngineStats::default());
        let config = EngineConfig::default();
        Fixture {
            dispatcher: Arc::new(Dispatcher::new(config.clone(), Arc::clone(&stats))),
            delivery: Arc::new(Delivery::new(config, stats)),
            session: Arc::new(Session::new(SessionId(1), "test".into())),
        }
    }

    fn submit_async(f: &Fixture, ino: u64) {
        f.dispatcher
            .dispatch(
                &f.session,
                EventSpec::plain(EventKind::Attribute, ObjectRef::regular(FsId(1), ino)),
                &DispatchOptions::default(),
            )
            .unwrap();
    }

    #[test]
    fn test_nonblocking_empty_would_block() {
        let f = setup();
        let opts = WaitOptions {
            non_blocking: true,
            ..Default::default()
        };
        assert!(matches!(
            f.delivery.get_events(&f.session, 8, 4096, &opts),
            Err(DmError::WouldBlock)
        ));
    }

    #[test]
    fn test_fifo_delivery_order() {
        let f = setup();
        for ino in [3, 1, 2] {
            submit_async(&f, ino);
        }
        let opts = WaitOptions {
            non_blocking: true,
            ..Default::default()
        };
        let events = f.delivery.get_events(&f.session, 10, 1 << 16, &opts).unwrap();
        let inos: Vec<u64> = events.iter().map(|e| e.object.ino).collect();
        assert_eq!(inos, vec![3, 1, 2]);
        assert!(f.session.state.lock().pending.is_empty());
    }

    #[test]
    fn test_async_events_finalized_at_delivery() {
        let f = setup();
        submit_async(&f, 1);
        let opts = WaitOptions {
            non_blocking: true,
            ..Default::default()
        };
        let events = f.delivery.get_events(&f.session, 1, 4096, &opts).unwrap();
        assert_eq!(events[0].token, Token::NONE);
        let state = f.session.state.lock();
        assert!(state.pending.is_empty());
        assert!(state.delivered.is_empty(), "no reply is ever expected");
    }

    #[test]
    fn test_sync_event_moves_to_delivered() {
        let f = setup();
        let d = Arc::clone(&f.dispatcher);
        let s = Arc::clone(&f.session);
        let producer = thread::spawn(move || {
            d.dispatch(
                &s,
                EventSpec::data(EventKind::Write, ObjectRef::regular(FsId(1), 7), 0, 4096),
                &DispatchOptions {
                    synchronous: true,
                    ..Default::default()
                },
            )
        });

        // Blocking read picks the event up once it arrives.
        let events = f
            .delivery
            .get_events(&f.session, 1, 4096, &WaitOptions::default())
            .unwrap();
        assert_eq!(events.len(), 1);
        let token = events[0].token;
        assert!(token.is_valid());
        {
            let state = f.session.state.lock();
            assert!(state.pending.is_empty());
            assert_eq!(state.delivered.len(), 1);
        }
        assert_eq!(f.delivery.list_tokens(&f.session), vec![token]);

        f.delivery
            .respond_event(&f.session, token, Disposition::Continue, 0)
            .unwrap();
        assert_eq!(producer.join().unwrap().unwrap(), Reply::Continue);
        assert!(f.session.state.lock().delivered.is_empty());
    }

    #[test]
    fn test_respond_twice_fails_not_found() {
        let f = setup();
        let d = Arc::clone(&f.dispatcher);
        let s = Arc::clone(&f.session);
        let producer = thread::spawn(move || {
            d.dispatch(
                &s,
                EventSpec::data(EventKind::Write, ObjectRef::regular(FsId(1), 7), 0, 64),
                &DispatchOptions {
                    synchronous: true,
                    ..Default::default()
                },
            )
        });
        let events = f
            .delivery
            .get_events(&f.session, 1, 4096, &WaitOptions::default())
            .unwrap();
        let token = events[0].token;
        f.delivery
            .respond_event(&f.session, token, Disposition::Abort, 5)
            .unwrap();
        assert!(matches!(
            f.delivery
                .respond_event(&f.session, token, Disposition::Abort, 5),
            Err(DmError::NotFound)
        ));
        assert_eq!(producer.join().unwrap().unwrap(), Reply::Abort(5));
    }

    #[test]
    fn test_disposition_validation() {
        let f = setup();
        assert!(matches!(
            f.delivery
                .respond_event(&f.session, Token(1), Disposition::Continue, 5),
            Err(DmError::Invalid { .. })
        ));
        assert!(matches!(
            f.delivery
                .respond_event(&f.session, Token(1), Disposition::Abort, 0),
            Err(DmError::Invalid { .. })
        ));
        assert!(matches!(
            f.delivery
                .respond_event(&f.session, Token(99), Disposition::Continue, 0),
            Err(DmError::NotFound)
        ));
    }

    #[test]
    fn test_dont_care_only_for_mount() {
        let f = setup();
        let d = Arc::clone(&f.dispatcher);
        let s = Arc::clone(&f.session);
        let producer = thread::spawn(move || {
            d.dispatch(
                &s,
                EventSpec::data(EventKind::Write, ObjectRef::regular(FsId(1), 7), 0, 64),
                &DispatchOptions {
                    synchronous: true,
                    ..Default::default()
                },
            )
        });
        let events = f
            .delivery
            .get_events(&f.session, 1, 4096, &WaitOptions::default())
            .unwrap();
        let token = events[0].token;
        assert!(matches!(
            f.delivery
                .respond_event(&f.session, token, Disposition::DontCare, 0),
            Err(DmError::Invalid { .. })
        ));
        f.delivery
            .respond_event(&f.session, token, Disposition::Continue, 0)
            .unwrap();
        producer.join().unwrap().unwrap();
    }

    #[test]
    fn test_too_big_and_partial_batch() {
        let f = setup();
        submit_async(&f, 1);
        submit_async(&f, 2);
        let opts = WaitOptions {
            non_blocking: true,
            ..Default::default()
        };

        // Not even one event fits.
        let err = f.delivery.get_events(&f.session, 10, 4, &opts).unwrap_err();
        let DmError::TooBig { needed, capacity } = err else {
            panic!("expected TooBig");
        };
        assert!(needed > capacity);
        assert_eq!(f.session.state.lock().pending.len(), 2, "nothing consumed");

        // One event fits: partial success, second stays queued.
        let one = bincode::serialized_size(&f.session.state.lock().pending.iter().next().unwrap().record())
            .unwrap() as usize;
        let events = f.delivery.get_events(&f.session, 10, one, &opts).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(f.session.state.lock().pending.len(), 1);
    }

    #[test]
    fn test_max_events_limit() {
        let f = setup();
        for ino in 0..5 {
            submit_async(&f, ino);
        }
        let opts = WaitOptions {
            non_blocking: true,
            ..Default::default()
        };
        let events = f.delivery.get_events(&f.session, 2, 1 << 16, &opts).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(f.session.state.lock().pending.len(), 3);
    }

    #[test]
    fn test_reader_interruptible() {
        let f = setup();
        let interrupt = InterruptToken::new();
        let opts = WaitOptions {
            non_blocking: false,
            interrupt: Some(interrupt.clone()),
        };
        let delivery = Arc::clone(&f.delivery);
        let session = Arc::clone(&f.session);
        let reader = thread::spawn(move || delivery.get_events(&session, 1, 4096, &opts));
        while f.session.state.lock().readers_waiting == 0 {
            thread::yield_now();
        }
        interrupt.raise();
        assert!(matches!(reader.join().unwrap(), Err(DmError::Interrupted)));
        assert_eq!(f.session.state.lock().readers_waiting, 0);
    }

    #[test]
    fn test_exactly_once_delivery_two_consumers() {
        let f = setup();
        for ino in 0..64 {
            submit_async(&f, ino);
        }
        let opts = WaitOptions {
            non_blocking: true,
            ..Default::default()
        };
        let mut readers = vec![];
        for _ in 0..2 {
            let delivery = Arc::clone(&f.delivery);
            let session = Arc::clone(&f.session);
            let opts = opts.clone();
            readers.push(thread::spawn(move || {
                let mut got = vec![];
                loop {
                    match delivery.get_events(&session, 4, 1 << 16, &opts) {
                        Ok(batch) => got.extend(batch),
                        Err(DmError::WouldBlock) => break,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                got
            }));
        }
        let mut seen = std::collections::HashSet::new();
        let mut total = 0;
        for r in readers {
            for rec in r.join().unwrap() {
                assert!(seen.insert(rec.seq), "event delivered twice");
                total += 1;
            }
        }
        assert_eq!(total, 64);
    }

    #[test]
    fn test_pending_lets_nonblocking_producer_give_up() {
        let f = setup();
        let d = Arc::clone(&f.dispatcher);
        let s = Arc::clone(&f.session);
        let producer = thread::spawn(move || {
            d.dispatch(
                &s,
                EventSpec::data(EventKind::Read, ObjectRef::regular(FsId(1), 7), 0, 64),
                &DispatchOptions {
                    synchronous: true,
                    non_blocking: true,
                    ..Default::default()
                },
            )
        });
        let events = f
            .delivery
            .get_events(&f.session, 1, 4096, &WaitOptions::default())
            .unwrap();
        let token = events[0].token;
        f.delivery.pending(&f.session, token).unwrap();
        assert!(matches!(
            producer.join().unwrap(),
            Err(DmError::WouldBlock)
        ));
        // The event is still outstanding; a reply still lands.
        f.delivery
            .respond_event(&f.session, token, Disposition::Continue, 0)
            .unwrap();
    }

    #[test]
    fn test_move_event_between_sessions() {
        let f = setup();
        let dst = Arc::new(Session::new(SessionId(2), "dst".into()));
        let d = Arc::clone(&f.dispatcher);
        let s = Arc::clone(&f.session);
        let producer = thread::spawn(move || {
            d.dispatch(
                &s,
                EventSpec::data(EventKind::Write, ObjectRef::regular(FsId(1), 7), 0, 64),
                &DispatchOptions {
                    synchronous: true,
                    ..Default::default()
                },
            )
        });
        let events = f
            .delivery
            .get_events(&f.session, 1, 4096, &WaitOptions::default())
            .unwrap();
        let token = events[0].token;
        f.delivery.move_event(&f.session, token, &dst).unwrap();
        assert!(f.session.state.lock().delivered.is_empty());
        assert!(f.session.state.lock().dedup.is_empty());
        assert_eq!(dst.state.lock().delivered.len(), 1);
        assert_eq!(dst.state.lock().dedup.len(), 1);
        assert!(matches!(
            f.delivery
                .respond_event(&f.session, token, Disposition::Continue, 0),
            Err(DmError::NotFound)
        ));
        f.delivery
            .respond_event(&dst, token, Disposition::Continue, 0)
            .unwrap();
        producer.join().unwrap().unwrap();
    }

    #[test]
    fn test_move_event_to_lower_id_session() {
        // Same relocation with the lock order reversed: the source id
        // is higher than the destination id.
        let f = setup();
        let src = Arc::new(Session::new(SessionId(2), "src".into()));
        let d = Arc::clone(&f.dispatcher);
        let s = Arc::clone(&src);
        let producer = thread::spawn(move || {
            d.dispatch(
                &s,
                EventSpec::data(EventKind::Write, ObjectRef::regular(FsId(1), 9), 0, 64),
                &DispatchOptions {
                    synchronous: true,
                    ..Default::default()
                },
            )
        });
        let events = f
            .delivery
            .get_events(&src, 1, 4096, &WaitOptions::default())
            .unwrap();
        let token = events[0].token;
        f.delivery.move_event(&src, token, &f.session).unwrap();
        assert!(src.state.lock().delivered.is_empty());
        assert!(src.state.lock().dedup.is_empty());
        assert_eq!(f.delivery.list_tokens(&f.session), vec![token]);
        f.delivery
            .respond_event(&f.session, token, Disposition::Continue, 0)
            .unwrap();
        producer.join().unwrap().unwrap();
    }

    #[test]
    fn test_error_return_leaves_nothing_claimed() {
        let f = setup();
        submit_async(&f, 1);
        let opts = WaitOptions {
            non_blocking: true,
            ..Default::default()
        };
        assert!(matches!(
            f.delivery.get_events(&f.session, 1, 2, &opts),
            Err(DmError::TooBig { .. })
        ));
        {
            let state = f.session.state.lock();
            let ev = state.pending.iter().next().unwrap();
            assert!(!ev.state.lock().claimed, "claim released on the error path");
        }
        // The event is still deliverable afterwards.
        let events = f.delivery.get_events(&f.session, 1, 1 << 16, &opts).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_find_event_copy() {
        let f = setup();
        let d = Arc::clone(&f.dispatcher);
        let s = Arc::clone(&f.session);
        let producer = thread::spawn(move || {
            d.dispatch(
                &s,
                EventSpec::data(EventKind::Truncate, ObjectRef::regular(FsId(1), 7), 0, 0),
                &DispatchOptions {
                    synchronous: true,
                    ..Default::default()
                },
            )
        });
        // Visible by token while still pending.
        let token = loop {
            let state = f.session.state.lock();
            if let Some(ev) = state.pending.iter().next() {
                break ev.token();
            }
            drop(state);
            thread::yield_now();
        };
        let rec = f.delivery.find_event(&f.session, token).unwrap();
        assert_eq!(rec.kind, EventKind::Truncate);
        assert!(matches!(
            f.delivery.find_event(&f.session, Token(999)),
            Err(DmError::NotFound)
        ));
        let events = f
            .delivery
            .get_events(&f.session, 1, 4096, &WaitOptions::default())
            .unwrap();
        f.delivery
            .respond_event(&f.session, events[0].token, Disposition::Continue, 0)
            .unwrap();
        producer.join().unwrap().unwrap();
    }

    #[test]
    fn test_delivery_wakes_blocked_writer() {
        let stats = Arc::new(EngineStats::default());
        let config = EngineConfig {
            max_pending_per_session: 1,
            ..EngineConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), Arc::clone(&stats)));
        let delivery = Delivery::new(config, stats);
        let session = Arc::new(Session::new(SessionId(1), "bp".into()));

        dispatcher
            .dispatch(
                &session,
                EventSpec::plain(EventKind::Attribute, ObjectRef::regular(FsId(1), 0)),
                &DispatchOptions::default(),
            )
            .unwrap();
        let d = Arc::clone(&dispatcher);
        let s = Arc::clone(&session);
        let writer = thread::spawn(move || {
            d.dispatch(
                &s,
                EventSpec::plain(EventKind::Attribute, ObjectRef::regular(FsId(1), 1)),
                &DispatchOptions::default(),
            )
        });
        while session.state.lock().writers_waiting == 0 {
            thread::yield_now();
        }
        let opts = WaitOptions {
            non_blocking: true,
            ..Default::default()
        };
        delivery.get_events(&session, 1, 4096, &opts).unwrap();
        writer.join().unwrap().unwrap();
        assert_eq!(session.state.lock().pending.len(), 1);
    }
}
