//! The engine facade: every producer- and consumer-facing entry point.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::delivery::{Delivery, WaitOptions};
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::error::{DmError, Result};
use crate::event::{Disposition, EventKind, EventRecord, EventSpec, FsId, Reply, Token};
use crate::flush::{self, FlushTarget};
use crate::fsreg::{FsRegistry, FsState};
use crate::interrupt::InterruptToken;
use crate::mount;
use crate::registry::SessionRegistry;
use crate::session::SessionId;
use crate::stats::{EngineStats, EngineStatsSnapshot};

/// The session/event-delivery engine. One instance per subsystem;
/// constructed at init and passed by handle, never a hidden singleton.
#[derive(Debug)]
pub struct DmEngine {
    sessions: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    delivery: Delivery,
    filesystems: FsRegistry,
    stats: Arc<EngineStats>,
}

impl Default for DmEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl DmEngine {
    /// Builds an engine with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        let stats = Arc::new(EngineStats::default());
        Self {
            sessions: Arc::new(SessionRegistry::new(&config)),
            dispatcher: Dispatcher::new(config.clone(), Arc::clone(&stats)),
            delivery: Delivery::new(config, Arc::clone(&stats)),
            filesystems: FsRegistry::new(),
            stats,
        }
    }

    // --- session management -------------------------------------------------

    /// Creates a session and returns its id.
    pub fn create_session(&self, info: &str) -> Result<SessionId> {
        let id = self.sessions.create(info)?;
        EngineStats::bump(&self.stats.sessions_created);
        Ok(id)
    }

    /// Destroys a session; fails `Busy` while events are queued or a
    /// reader or writer is blocked on it.
    pub fn destroy_session(&self, sid: SessionId) -> Result<()> {
        self.sessions.destroy(sid)?;
        EngineStats::bump(&self.stats.sessions_destroyed);
        Ok(())
    }

    /// Live session ids, ascending.
    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.sessions.list()
    }

    /// The info string a session was created with.
    pub fn query_session(&self, sid: SessionId) -> Result<String> {
        Ok(self.sessions.find(sid)?.info().to_string())
    }

    /// Opts a session in or out of mount broadcasts.
    pub fn set_mount_interest(&self, sid: SessionId, interested: bool) -> Result<()> {
        self.sessions.find(sid)?.set_mount_interest(interested);
        Ok(())
    }

    // --- producer-facing ----------------------------------------------------

    /// Submits an event routed by the target filesystem's disposition
    /// table; synchronicity comes from the kind's fixed table.
    pub fn submit_normal_event(&self, spec: EventSpec, opts: &WaitOptions) -> Result<Reply> {
        let sid = self
            .filesystems
            .disposition(spec.object.fsid, spec.kind)
            .ok_or(DmError::NotFound)?;
        let synchronous = spec.kind.is_synchronous();
        self.submit_targeted_event(sid, spec, synchronous, opts)
    }

    /// Runs the mount broadcast for the event's filesystem.
    pub fn submit_mount_event(
        &self,
        spec: EventSpec,
        interrupt: Option<InterruptToken>,
    ) -> Result<Reply> {
        mount::broadcast_mount(
            &self.sessions,
            &self.dispatcher,
            &self.filesystems,
            spec,
            interrupt,
        )
    }

    /// Submits an event to an explicit session.
    pub fn submit_targeted_event(
        &self,
        sid: SessionId,
        spec: EventSpec,
        synchronous: bool,
        opts: &WaitOptions,
    ) -> Result<Reply> {
        let session = self.sessions.find(sid)?;
        let dispatch_opts = DispatchOptions {
            synchronous,
            non_blocking: opts.non_blocking,
            forced: false,
            interrupt: opts.interrupt.clone(),
        };
        self.dispatcher.dispatch(&session, spec, &dispatch_opts)
    }

    /// Always-accepted escalation path: queues without backpressure and
    /// returns the token without waiting for a reply.
    pub fn submit_preformed_event(&self, sid: SessionId, spec: EventSpec) -> Result<Token> {
        let session = self.sessions.find(sid)?;
        self.dispatcher.enqueue_preformed(&session, spec)
    }

    // --- consumer-facing ----------------------------------------------------

    /// Pulls up to `max_events` queued events, charging each one's
    /// serialized size against `max_bytes`. A batch cut short by the
    /// buffer budget is a success as long as it holds at least one
    /// event; `TooBig` means not even the first event fit.
    pub fn get_events(
        &self,
        sid: SessionId,
        max_events: usize,
        max_bytes: usize,
        opts: &WaitOptions,
    ) -> Result<Vec<EventRecord>> {
        let session = self.sessions.find(sid)?;
        self.delivery.get_events(&session, max_events, max_bytes, opts)
    }

    /// Applies a disposition to a delivered event.
    pub fn respond_event(
        &self,
        sid: SessionId,
        token: Token,
        disposition: Disposition,
        errno: i32,
    ) -> Result<()> {
        let session = self.sessions.find(sid)?;
        self.delivery.respond_event(&session, token, disposition, errno)
    }

    /// Relocates a delivered event to another session.
    pub fn move_event(&self, src: SessionId, token: Token, dst: SessionId) -> Result<()> {
        let src_session = self.sessions.find(src)?;
        let dst_session = self.sessions.find(dst)?;
        self.delivery.move_event(&src_session, token, &dst_session)
    }

    /// Marks a delivered event intermediate so non-blocking producers
    /// can give up early.
    pub fn pending(&self, sid: SessionId, token: Token) -> Result<()> {
        let session = self.sessions.find(sid)?;
        self.delivery.pending(&session, token)
    }

    /// Copies out an event by token.
    pub fn find_event(&self, sid: SessionId, token: Token) -> Result<EventRecord> {
        let session = self.sessions.find(sid)?;
        self.delivery.find_event(&session, token)
    }

    /// Tokens of all outstanding (delivered, unanswered) events.
    pub fn list_tokens(&self, sid: SessionId) -> Result<Vec<Token>> {
        let session = self.sessions.find(sid)?;
        Ok(self.delivery.list_tokens(&session))
    }

    // --- filesystem registration -------------------------------------------

    /// Routes events of `kind` on `fsid` to `sid`.
    pub fn set_disposition(&self, fsid: FsId, kind: EventKind, sid: SessionId) -> Result<()> {
        self.sessions.find(sid)?;
        self.filesystems.set_disposition(fsid, kind, sid)
    }

    /// Drops a filesystem's registration after unmount.
    pub fn unregister_filesystem(&self, fsid: FsId) -> Result<()> {
        self.filesystems.unregister(fsid)
    }

    /// Current registration state of a filesystem.
    pub fn filesystem_state(&self, fsid: FsId) -> Option<FsState> {
        self.filesystems.state(fsid)
    }

    // --- teardown -----------------------------------------------------------

    /// Force-terminates every outstanding event referencing `target`
    /// with `Reply::Abort(errno)`. Returns the records of events that
    /// had no waiter attached.
    pub fn flush(&self, target: FlushTarget, errno: i32) -> Vec<EventRecord> {
        flush::flush(&self.sessions, &self.stats, target, errno)
    }

    /// Point-in-time engine counters.
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ObjectRef;
    use std::thread;

    #[test]
    fn test_session_lifecycle_surface() {
        let engine = DmEngine::default();
        let sid = engine.create_session("hsm daemon").unwrap();
        assert_eq!(engine.list_sessions(), vec![sid]);
        assert_eq!(engine.query_session(sid).unwrap(), "hsm daemon");
        engine.destroy_session(sid).unwrap();
        assert!(engine.list_sessions().is_empty());
        assert!(matches!(
            engine.query_session(sid),
            Err(DmError::NotFound)
        ));
        let snap = engine.stats();
        assert_eq!(snap.sessions_created, 1);
        assert_eq!(snap.sessions_destroyed, 1);
    }

    #[test]
    fn test_normal_event_routed_by_disposition() {
        let engine = Arc::new(DmEngine::default());
        let sid = engine.create_session("hsm").unwrap();
        let fsid = FsId(1);
        engine.set_disposition(fsid, EventKind::Close, sid).unwrap();

        // No disposition for this kind.
        assert!(matches!(
            engine.submit_normal_event(
                EventSpec::plain(EventKind::Attribute, ObjectRef::regular(fsid, 1)),
                &WaitOptions::default()
            ),
            Err(DmError::NotFound)
        ));

        // Close is asynchronous: accepted and queued.
        engine
            .submit_normal_event(
                EventSpec::plain(EventKind::Close, ObjectRef::regular(fsid, 1)),
                &WaitOptions::default(),
            )
            .unwrap();
        let opts = WaitOptions {
            non_blocking: true,
            ..Default::default()
        };
        let events = engine.get_events(sid, 8, 4096, &opts).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Close);
    }

    #[test]
    fn test_set_disposition_requires_live_session() {
        let engine = DmEngine::default();
        assert!(matches!(
            engine.set_disposition(FsId(1), EventKind::Read, SessionId(42)),
            Err(DmError::NotFound)
        ));
    }

    #[test]
    fn test_write_handshake_end_to_end() {
        // Thread A submits a synchronous WRITE and blocks; thread B
        // reads it, replies Continue, and A unblocks with the reply.
        let engine = Arc::new(DmEngine::default());
        let sid = engine.create_session("hsm").unwrap();
        assert_eq!(sid.as_u64(), 1);

        let e = Arc::clone(&engine);
        let producer = thread::spawn(move || {
            e.submit_targeted_event(
                sid,
                EventSpec::data(EventKind::Write, ObjectRef::regular(FsId(1), 42), 0, 4096),
                true,
                &WaitOptions::default(),
            )
        });

        let events = engine
            .get_events(sid, 1, 4096, &WaitOptions::default())
            .unwrap();
        assert_eq!(events[0].kind, EventKind::Write);
        let token = events[0].token;
        assert_eq!(token, Token(1));
        engine
            .respond_event(sid, token, Disposition::Continue, 0)
            .unwrap();
        assert_eq!(producer.join().unwrap().unwrap(), Reply::Continue);
    }

    #[test]
    fn test_preformed_event_always_accepted() {
        let engine = DmEngine::new(EngineConfig {
            max_pending_per_session: 1,
            ..EngineConfig::default()
        });
        let sid = engine.create_session("hsm").unwrap();
        engine
            .submit_targeted_event(
                sid,
                EventSpec::plain(EventKind::Close, ObjectRef::regular(FsId(1), 1)),
                false,
                &WaitOptions::default(),
            )
            .unwrap();
        // Queue is at its limit; the escalation path still lands.
        let token = engine
            .submit_preformed_event(
                sid,
                EventSpec::plain(EventKind::Nospace, ObjectRef::filesystem(FsId(1))),
            )
            .unwrap();
        assert!(token.is_valid());
        assert_eq!(engine.list_tokens(sid).unwrap(), vec![]);
        let rec = engine.find_event(sid, token).unwrap();
        assert_eq!(rec.kind, EventKind::Nospace);
    }

    #[test]
    fn test_destroy_busy_then_ok_after_drain() {
        let engine = Arc::new(DmEngine::default());
        let sid = engine.create_session("hsm").unwrap();
        engine
            .submit_targeted_event(
                sid,
                EventSpec::plain(EventKind::Close, ObjectRef::regular(FsId(1), 1)),
                false,
                &WaitOptions::default(),
            )
            .unwrap();
        assert!(matches!(engine.destroy_session(sid), Err(DmError::Busy)));
        let opts = WaitOptions {
            non_blocking: true,
            ..Default::default()
        };
        engine.get_events(sid, 8, 4096, &opts).unwrap();
        engine.destroy_session(sid).unwrap();
    }

    #[test]
    fn test_flush_surfaces_like_abort() {
        let engine = Arc::new(DmEngine::default());
        let sid = engine.create_session("hsm").unwrap();
        let e = Arc::clone(&engine);
        let producer = thread::spawn(move || {
            e.submit_targeted_event(
                sid,
                EventSpec::data(EventKind::Read, ObjectRef::regular(FsId(7), 3), 0, 512),
                true,
                &WaitOptions::default(),
            )
        });
        loop {
            match engine.list_sessions().first() {
                Some(_) if engine.stats().events_submitted > 0 => break,
                _ => thread::yield_now(),
            }
        }
        engine.flush(FlushTarget::Filesystem(FsId(7)), 5);
        assert_eq!(producer.join().unwrap().unwrap(), Reply::Abort(5));
    }
}
