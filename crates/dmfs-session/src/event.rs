//! Event types: kinds, tokens, target identities, replies, and the
//! internal reference-counted event record.
//!
//! The kind → synchronous mapping in [`EventKind::is_synchronous`] is
//! fixed configuration data: producers of synchronous kinds block for a
//! reply, producers of asynchronous kinds fire and forget.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// One filesystem occurrence queued for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A data read on a managed region.
    Read,
    /// A data write on a managed region.
    Write,
    /// A truncate on a managed region.
    Truncate,
    /// Namespace: entry about to be created.
    Create,
    /// Namespace: entry was created.
    PostCreate,
    /// Namespace: entry about to be removed.
    Remove,
    /// Namespace: entry was removed.
    PostRemove,
    /// Namespace: entry about to be renamed.
    Rename,
    /// Namespace: entry was renamed.
    PostRename,
    /// Namespace: symlink about to be created.
    Symlink,
    /// Namespace: symlink was created.
    PostSymlink,
    /// Namespace: hard link about to be created.
    Link,
    /// Namespace: hard link was created.
    PostLink,
    /// Filesystem is being mounted; broadcast to mount-interested sessions.
    Mount,
    /// Filesystem unmount is starting.
    Preunmount,
    /// Filesystem unmount has committed. Queued with a token but the
    /// producer never waits on it.
    Unmount,
    /// Filesystem ran out of space on a managed operation.
    Nospace,
    /// Object attributes changed.
    Attribute,
    /// Last close of a managed object.
    Close,
    /// Managed object is being destroyed.
    Destroy,
    /// Reserved; never dispatched.
    Cancel,
}

impl EventKind {
    /// Fixed table: does a producer of this kind block for a reply?
    pub fn is_synchronous(self) -> bool {
        matches!(
            self,
            EventKind::Read
                | EventKind::Write
                | EventKind::Truncate
                | EventKind::Create
                | EventKind::Remove
                | EventKind::Rename
                | EventKind::Symlink
                | EventKind::Link
                | EventKind::Mount
                | EventKind::Preunmount
                | EventKind::Unmount
                | EventKind::Nospace
        )
    }

    /// Only data events on regular files participate in duplicate
    /// detection and coalescing.
    pub fn is_dedup_eligible(self) -> bool {
        matches!(self, EventKind::Read | EventKind::Write | EventKind::Truncate)
    }

    /// Kinds the dispatcher accepts at all.
    pub fn is_supported(self) -> bool {
        !matches!(self, EventKind::Cancel)
    }
}

/// Identifier of a synchronous event while it is live, used by the
/// application to reply. Unique across the engine among live events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(pub u64);

impl Token {
    /// Sentinel carried by asynchronous events; never looked up.
    pub const NONE: Token = Token(0);

    /// Returns the raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// True for any token other than the sentinel.
    pub fn is_valid(self) -> bool {
        self != Token::NONE
    }
}

/// Filesystem identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FsId(pub u64);

/// Coarse object class; duplicate detection applies to regular files only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    /// A regular file.
    Regular,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// The filesystem itself (mount, unmount, nospace).
    Filesystem,
    /// Anything else.
    Other,
}

/// Identity of the object an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Owning filesystem.
    pub fsid: FsId,
    /// Inode number within the filesystem; 0 for filesystem-level events.
    pub ino: u64,
    /// Object class.
    pub ftype: ObjectType,
}

impl ObjectRef {
    /// A regular-file object.
    pub fn regular(fsid: FsId, ino: u64) -> Self {
        Self {
            fsid,
            ino,
            ftype: ObjectType::Regular,
        }
    }

    /// The filesystem-level object used by mount/unmount/nospace events.
    pub fn filesystem(fsid: FsId) -> Self {
        Self {
            fsid,
            ino: 0,
            ftype: ObjectType::Filesystem,
        }
    }
}

/// Offset/length payload of the range-based data events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Byte offset of the accessed region.
    pub offset: u64,
    /// Length in bytes of the accessed region.
    pub length: u64,
}

/// Disposition an application passes to `respond_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// Let the blocked operation proceed. Carries no error.
    Continue,
    /// Fail the blocked operation with a positive error code.
    Abort,
    /// Decline to arbitrate. Legal only for Mount events.
    DontCare,
}

/// Outcome delivered to a blocked producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Operation may proceed.
    Continue,
    /// Operation fails with this error code. Flush-induced terminations
    /// arrive this way too, indistinguishable from an application abort.
    Abort(i32),
    /// Mount arbitration only: this session declined.
    DontCare,
}

/// What a producer hands to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSpec {
    /// Event kind.
    pub kind: EventKind,
    /// Target object identity.
    pub object: ObjectRef,
    /// Offset/length for Read/Write/Truncate.
    pub range: Option<ByteRange>,
    /// Entry name for namespace events.
    pub name: Option<String>,
    /// Destination name for rename events.
    pub new_name: Option<String>,
}

impl EventSpec {
    /// A data event (Read/Write/Truncate) on a byte range.
    pub fn data(kind: EventKind, object: ObjectRef, offset: u64, length: u64) -> Self {
        Self {
            kind,
            object,
            range: Some(ByteRange { offset, length }),
            name: None,
            new_name: None,
        }
    }

    /// A namespace or object-level event without a range.
    pub fn plain(kind: EventKind, object: ObjectRef) -> Self {
        Self {
            kind,
            object,
            range: None,
            name: None,
            new_name: None,
        }
    }
}

/// The copy of an event a consumer receives from `get_events` or
/// `find_event`. Serialized with bincode when accounting for the
/// caller's buffer budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Token to reply with; `Token::NONE` for asynchronous events.
    pub token: Token,
    /// Global sequence number.
    pub seq: u64,
    /// Event kind.
    pub kind: EventKind,
    /// Target object identity.
    pub object: ObjectRef,
    /// Offset/length payload, if any.
    pub range: Option<ByteRange>,
    /// Entry name for namespace events.
    pub name: Option<String>,
    /// Destination name for rename events.
    pub new_name: Option<String>,
}

/// Key identifying "the same request" for dedup and coalescing:
/// kind + target + range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct DedupKey {
    pub(crate) kind: EventKind,
    pub(crate) fsid: FsId,
    pub(crate) ino: u64,
    pub(crate) offset: u64,
    pub(crate) length: u64,
}

/// Mutable half of an event, guarded by the event lock.
#[derive(Debug)]
pub(crate) struct EventState {
    /// Non-sentinel iff the kind is synchronous.
    pub(crate) token: Token,
    /// Global sequence number, assigned at enqueue.
    pub(crate) seq: u64,
    /// A consumer is mid-serialization; nobody else may deliver it.
    pub(crate) claimed: bool,
    /// Present in its session's dedup index.
    pub(crate) indexed: bool,
    /// `pending` was called; non-blocking waiters may give up.
    pub(crate) intermediate: bool,
    /// Final flag: a reply or flush has resolved the event.
    pub(crate) completed: bool,
    /// Terminated by a lifecycle flush rather than a reply.
    pub(crate) flushed: bool,
    /// Set together with `completed`.
    pub(crate) reply: Option<Reply>,
    /// The original producer is blocked awaiting the reply.
    pub(crate) producer_waiting: bool,
    /// Coalesced producers sharing this event's outcome.
    pub(crate) extra_waiters: u32,
}

/// The internal event record. Shared ownership: the owning queue, the
/// original producer, and each coalesced waiter hold an `Arc`; the
/// allocation is released when the last holder drops it after the
/// completed flag is set.
#[derive(Debug)]
pub(crate) struct Event {
    pub(crate) kind: EventKind,
    pub(crate) object: ObjectRef,
    pub(crate) range: Option<ByteRange>,
    pub(crate) name: Option<String>,
    pub(crate) new_name: Option<String>,
    /// Precomputed dedup key; `Some` only for eligible kinds on a
    /// regular-file target.
    pub(crate) dedup_key: Option<DedupKey>,
    pub(crate) state: Mutex<EventState>,
    /// Wakes the producer and coalesced waiters on reply, flush, or
    /// `pending`.
    pub(crate) reply_cv: Condvar,
}

impl Event {
    pub(crate) fn from_spec(spec: EventSpec) -> Self {
        let dedup_key = if spec.kind.is_dedup_eligible() && spec.object.ftype == ObjectType::Regular
        {
            let range = spec.range.unwrap_or(ByteRange {
                offset: 0,
                length: 0,
            });
            Some(DedupKey {
                kind: spec.kind,
                fsid: spec.object.fsid,
                ino: spec.object.ino,
                offset: range.offset,
                length: range.length,
            })
        } else {
            None
        };
        Self {
            kind: spec.kind,
            object: spec.object,
            range: spec.range,
            name: spec.name,
            new_name: spec.new_name,
            dedup_key,
            state: Mutex::new(EventState {
                token: Token::NONE,
                seq: 0,
                claimed: false,
                indexed: false,
                intermediate: false,
                completed: false,
                flushed: false,
                reply: None,
                producer_waiting: false,
                extra_waiters: 0,
            }),
            reply_cv: Condvar::new(),
        }
    }

    /// Consumer-visible copy of this event.
    pub(crate) fn record(&self) -> EventRecord {
        let state = self.state.lock();
        EventRecord {
            token: state.token,
            seq: state.seq,
            kind: self.kind,
            object: self.object,
            range: self.range,
            name: self.name.clone(),
            new_name: self.new_name.clone(),
        }
    }

    /// Current token; `Token::NONE` until stamped.
    pub(crate) fn token(&self) -> Token {
        self.state.lock().token
    }

    /// Resolves the event and wakes everyone blocked on it.
    pub(crate) fn complete(&self, reply: Reply, flushed: bool) {
        let mut state = self.state.lock();
        state.reply = Some(reply);
        state.completed = true;
        if flushed {
            state.flushed = true;
        }
        drop(state);
        self.reply_cv.notify_all();
    }
}
