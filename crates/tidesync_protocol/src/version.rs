//! Version/tombstone conflict resolution.
//!
//! Resolution is whole-record last-writer-wins on a monotonic version
//! counter, with one extra rule: a deletion is never undone by an ordinary
//! out-of-order write. The only sanctioned resurrection is an undelete that
//! jumps the version by at least the undelete delta, and any server-side
//! guard must use the same threshold.

use serde::{Deserialize, Serialize};

/// Minimum version jump that turns a tombstone back into a live record.
pub const DEFAULT_UNDELETE_DELTA: u64 = 1000;

/// The minimal comparable state of one record on one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VersionState {
    /// Monotonic version.
    pub version: u64,
    /// Tombstone flag.
    pub deleted: bool,
}

impl VersionState {
    /// Creates a version state.
    pub fn new(version: u64, deleted: bool) -> Self {
        Self { version, deleted }
    }

    /// Returns true if `self` is a live record that clears the tombstone
    /// `tombstone` with a jump of at least `undelete_delta`.
    pub fn undeletes(&self, tombstone: &VersionState, undelete_delta: u64) -> bool {
        tombstone.deleted
            && !self.deleted
            && self
                .version
                .checked_sub(tombstone.version)
                .is_some_and(|ahead| ahead >= undelete_delta)
    }

    /// Resolves this (local) state against a remote one.
    pub fn resolve_against(&self, remote: &VersionState, undelete_delta: u64) -> SyncAction {
        resolve(
            self.version,
            self.deleted,
            remote.version,
            remote.deleted,
            undelete_delta,
        )
    }
}

/// What to do with a record that exists on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncAction {
    /// Remote is authoritative; copy it locally.
    Pull,
    /// Local is authoritative; send it to the remote.
    Push,
    /// Remote tombstone wins; mark the local record deleted.
    AdoptTombstone,
    /// Both sides agree.
    Skip,
}

/// What to do when at least one side has no record at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExistenceAction {
    /// Materialize the remote row locally.
    CreateLocal,
    /// Send the local record to the remote.
    CreateRemote,
    /// Nothing to do.
    Skip,
}

/// Computes the reconciliation action for a `(local, remote)` pair.
///
/// Rules, in order:
/// 1. Remote tombstone against a live local record: adopt the tombstone,
///    unless local is at least `undelete_delta` ahead (explicit undelete).
/// 2. Local tombstone against a live remote record: push.
/// 3. Same deletion state: higher version wins, equal versions skip.
pub fn resolve(
    local_version: u64,
    local_deleted: bool,
    remote_version: u64,
    remote_deleted: bool,
    undelete_delta: u64,
) -> SyncAction {
    if remote_deleted && !local_deleted {
        let is_undelete = local_version
            .checked_sub(remote_version)
            .is_some_and(|ahead| ahead >= undelete_delta);
        return if is_undelete {
            SyncAction::Push
        } else {
            SyncAction::AdoptTombstone
        };
    }

    if local_deleted && !remote_deleted {
        return SyncAction::Push;
    }

    match remote_version.cmp(&local_version) {
        std::cmp::Ordering::Greater => SyncAction::Pull,
        std::cmp::Ordering::Less => SyncAction::Push,
        std::cmp::Ordering::Equal => SyncAction::Skip,
    }
}

/// Computes the action when one side may be missing the record.
///
/// A tombstone that never existed locally is not materialized, and a local
/// tombstone that never reached the remote is not uploaded.
pub fn resolve_existence(
    local_exists: bool,
    remote_exists: bool,
    local_deleted: bool,
    remote_deleted: bool,
) -> ExistenceAction {
    match (local_exists, remote_exists) {
        (false, true) if !remote_deleted => ExistenceAction::CreateLocal,
        (true, false) if !local_deleted => ExistenceAction::CreateRemote,
        _ => ExistenceAction::Skip,
    }
}
