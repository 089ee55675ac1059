//! Ordered mount broadcast arbitration.

use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::error::{DmError, Result};
use crate::event::{EventKind, EventSpec, Reply};
use crate::fsreg::FsRegistry;
use crate::interrupt::InterruptToken;
use crate::registry::SessionRegistry;

/// Walks mount-interested sessions in ascending id order, one full
/// synchronous dispatch at a time, until a session claims the mount
/// with Continue or Abort. DontCare replies are skipped and the scan
/// resumes from the next higher id, re-read live so sessions created
/// or destroyed mid-scan are honored. No claimant implies Continue.
///
/// Continue commits the filesystem's registration as mounted; Abort
/// (or any dispatch error) rolls it back.
pub(crate) fn broadcast_mount(
    sessions: &SessionRegistry,
    dispatcher: &Dispatcher,
    filesystems: &FsRegistry,
    spec: EventSpec,
    interrupt: Option<InterruptToken>,
) -> Result<Reply> {
    if spec.kind != EventKind::Mount {
        return Err(DmError::invalid("mount broadcast requires a Mount event"));
    }
    let fsid = spec.object.fsid;
    filesystems.begin_mount(fsid)?;

    let mut last_id = 0u64;
    let outcome = loop {
        let Some(session) = sessions.next_mount_interested_after(last_id) else {
            break Ok(Reply::Continue);
        };
        last_id = session.id().as_u64();
        let opts = DispatchOptions {
            synchronous: true,
            interrupt: interrupt.clone(),
            ..Default::default()
        };
        match dispatcher.dispatch(&session, spec.clone(), &opts) {
            Ok(Reply::DontCare) => {
                tracing::debug!("session {} declined mount of {:?}", session.id(), fsid);
                continue;
            }
            other => break other,
        }
    };

    match outcome {
        Ok(Reply::Abort(errno)) => {
            tracing::debug!("mount of {:?} aborted with errno {}", fsid, errno);
            filesystems.rollback_mount(fsid);
            Ok(Reply::Abort(errno))
        }
        Ok(_) => {
            filesystems.commit_mount(fsid);
            Ok(Reply::Continue)
        }
        Err(e) => {
            filesystems.rollback_mount(fsid);
            Err(e)
        }
    }
}
