//! Per-filesystem registration and event dispositions.
//!
//! Only the surface the engine itself consumes: `submit_normal_event`
//! routes through the disposition table, and mount broadcast commits or
//! rolls back the visible registration.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{DmError, Result};
use crate::event::{EventKind, FsId};
use crate::session::SessionId;

/// Visible registration state of a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsState {
    /// Mount broadcast in progress; rolled back on Abort.
    Registering,
    /// Mount arbitration finished with Continue.
    Mounted,
}

#[derive(Debug, Default)]
struct FsEntry {
    state: Option<FsState>,
    dispositions: HashMap<EventKind, SessionId>,
}

/// Table of data-management-capable filesystems.
#[derive(Debug, Default)]
pub struct FsRegistry {
    entries: Mutex<HashMap<FsId, FsEntry>>,
}

impl FsRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes the filesystem visible as Registering. Fails `Busy` if it
    /// is already registered.
    pub(crate) fn begin_mount(&self, fsid: FsId) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(fsid).or_default();
        if entry.state.is_some() {
            return Err(DmError::Busy);
        }
        entry.state = Some(FsState::Registering);
        Ok(())
    }

    /// Finalizes the registration as Mounted.
    pub(crate) fn commit_mount(&self, fsid: FsId) {
        if let Some(entry) = self.entries.lock().get_mut(&fsid) {
            entry.state = Some(FsState::Mounted);
        }
        tracing::debug!("filesystem {:?} mounted", fsid);
    }

    /// Rolls back a failed mount: the registration disappears.
    pub(crate) fn rollback_mount(&self, fsid: FsId) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&fsid) {
            entry.state = None;
            if entry.dispositions.is_empty() {
                entries.remove(&fsid);
            }
        }
        tracing::debug!("filesystem {:?} mount rolled back", fsid);
    }

    /// Drops the filesystem after unmount.
    pub(crate) fn unregister(&self, fsid: FsId) -> Result<()> {
        self.entries
            .lock()
            .remove(&fsid)
            .map(|_| ())
            .ok_or(DmError::NotFound)
    }

    /// Routes events of `kind` on `fsid` to `session`.
    pub(crate) fn set_disposition(
        &self,
        fsid: FsId,
        kind: EventKind,
        session: SessionId,
    ) -> Result<()> {
        if !kind.is_supported() {
            return Err(DmError::Unsupported { kind });
        }
        let mut entries = self.entries.lock();
        let entry = entries.entry(fsid).or_default();
        entry.dispositions.insert(kind, session);
        Ok(())
    }

    /// The session handling `kind` on `fsid`, if any.
    pub(crate) fn disposition(&self, fsid: FsId, kind: EventKind) -> Option<SessionId> {
        self.entries
            .lock()
            .get(&fsid)?
            .dispositions
            .get(&kind)
            .copied()
    }

    /// Current registration state, if the filesystem is known.
    pub fn state(&self, fsid: FsId) -> Option<FsState> {
        self.entries.lock().get(&fsid)?.state
    }
}
