//! Pull/merge engine: applies remote rows to local entities.

use crate::echo::EchoTracker;
use crate::entity::SyncableEntity;
use crate::error::{SyncError, SyncResult};
use crate::registry::EntityConfig;
use crate::session::SyncSession;
use std::fmt;
use std::sync::Arc;
use tidesync_crypto::FieldCipher;
use tidesync_protocol::{
    resolve, resolve_existence, ExistenceAction, SyncAction, VersionState, WireRecord, WireValue,
};
use tracing::{debug, warn};

/// Why a remote row was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// This process pushed the row moments ago.
    Echo,
    /// Both sides are at the same version and deletion state.
    InSync,
    /// Local is ahead; it will be pushed.
    LocalNewer,
    /// Local tombstone not yet on the remote; it will be pushed.
    LocalTombstonePending,
}

/// Why a newer remote row was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The update would blank a protected non-empty field.
    ProtectedField {
        /// Column name.
        column: String,
    },
    /// The configured validator refused the update.
    Validator,
    /// An encrypted column could not be decrypted.
    Decryption {
        /// Column name.
        column: String,
    },
    /// A column could not be converted to the field's type.
    InvalidField {
        /// Column name.
        column: String,
        /// Conversion error.
        message: String,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ProtectedField { column } => {
                write!(f, "would blank protected field {column}")
            }
            RejectReason::Validator => f.write_str("validator refused update"),
            RejectReason::Decryption { column } => write!(f, "cannot decrypt {column}"),
            RejectReason::InvalidField { column, message } => {
                write!(f, "invalid value for {column}: {message}")
            }
        }
    }
}

/// Result of merging one remote row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The local entity now reflects the remote row.
    Updated,
    /// Nothing was changed.
    Skipped(SkipReason),
    /// The remote row is newer but was refused; local is unchanged.
    Rejected(RejectReason),
    /// No local entity exists; the caller must materialize one.
    RequiresCreation,
}

impl MergeOutcome {
    /// Returns true if the local entity changed.
    pub fn is_updated(&self) -> bool {
        matches!(self, MergeOutcome::Updated)
    }
}

/// Applies remote rows to local entities.
#[derive(Debug)]
pub struct PullEngine {
    echo: Arc<EchoTracker>,
    undelete_delta: u64,
}

impl PullEngine {
    /// Creates a pull engine.
    pub fn new(echo: Arc<EchoTracker>, undelete_delta: u64) -> Self {
        Self {
            echo,
            undelete_delta,
        }
    }

    /// Merges `record` into `local`.
    ///
    /// Order of checks:
    /// 1. no local entity: `RequiresCreation`;
    /// 2. recent echo of our own push: skipped;
    /// 3. conflict resolution; at equal versions only deletion drift is
    ///    healed, no fields are copied;
    /// 4. for a newer remote row: decrypt, protected-field guard,
    ///    validator, then copy fields and adopt the remote version state.
    ///
    /// A rejected merge leaves `local` untouched.
    ///
    /// # Errors
    ///
    /// Only for a malformed row (missing or invalid `id`/`version`).
    pub fn merge_into<E: SyncableEntity>(
        &self,
        record: &WireRecord,
        local: Option<&mut E>,
        config: &EntityConfig<E>,
        session: Option<&SyncSession>,
    ) -> SyncResult<MergeOutcome> {
        let table = config.table_name();
        let id = record.id()?;
        let remote_state = record.version_state()?;

        let Some(local) = local else {
            return Ok(MergeOutcome::RequiresCreation);
        };

        if self.echo.was_pushed_recently(id, table) {
            debug!(table, entity_id = id, "skipping echo of own push");
            return Ok(MergeOutcome::Skipped(SkipReason::Echo));
        }

        let local_state = local.version_state();
        let action = resolve(
            local_state.version,
            local_state.deleted,
            remote_state.version,
            remote_state.deleted,
            self.undelete_delta,
        );

        match action {
            SyncAction::Skip => Ok(MergeOutcome::Skipped(SkipReason::InSync)),
            // A peer undeleted the row; the stale local tombstone must not win.
            SyncAction::Push if remote_state.undeletes(&local_state, self.undelete_delta) => {
                debug!(table, entity_id = id, version = remote_state.version, "pulling remote undelete");
                Ok(self.pull_newer(record, local, remote_state, config, session))
            }
            SyncAction::Push if local_state.deleted && !remote_state.deleted => {
                Ok(MergeOutcome::Skipped(SkipReason::LocalTombstonePending))
            }
            SyncAction::Push => Ok(MergeOutcome::Skipped(SkipReason::LocalNewer)),
            SyncAction::AdoptTombstone => {
                let version = local_state.version.max(remote_state.version);
                local.set_version_state(VersionState::new(version, true));
                debug!(table, entity_id = id, version, "adopted remote tombstone");
                Ok(MergeOutcome::Updated)
            }
            SyncAction::Pull => Ok(self.pull_newer(record, local, remote_state, config, session)),
        }
    }

    fn pull_newer<E: SyncableEntity>(
        &self,
        record: &WireRecord,
        local: &mut E,
        remote_state: VersionState,
        config: &EntityConfig<E>,
        session: Option<&SyncSession>,
    ) -> MergeOutcome {
        let outcome = self.apply_newer(record, local, remote_state, config, session);
        if let MergeOutcome::Rejected(reason) = &outcome {
            warn!(table = config.table_name(), entity_id = local.id(), %reason, "rejected remote update");
        }
        outcome
    }

    /// Builds a new local entity from a remote-only row.
    ///
    /// Returns `None` for a tombstone, which is never materialized, and
    /// for a row whose fields cannot be applied.
    ///
    /// # Errors
    ///
    /// `NoFactory` if the type has no factory, or a malformed row.
    pub fn materialize<E: SyncableEntity>(
        &self,
        record: &WireRecord,
        config: &EntityConfig<E>,
        session: Option<&SyncSession>,
    ) -> SyncResult<Option<E>> {
        let id = record.id()?;
        let remote_state = record.version_state()?;
        if resolve_existence(false, true, false, remote_state.deleted) != ExistenceAction::CreateLocal
        {
            return Ok(None);
        }

        let mut entity = config.create(id)?;
        let decoded = match decode_fields(record, config, session) {
            Ok(decoded) => decoded,
            Err(reason) => {
                warn!(table = config.table_name(), entity_id = id, %reason, "cannot materialize remote row");
                return Ok(None);
            }
        };
        if let Err(reason) = apply_fields(&mut entity, &decoded, config) {
            warn!(table = config.table_name(), entity_id = id, %reason, "cannot materialize remote row");
            return Ok(None);
        }
        entity.set_version_state(remote_state);
        Ok(Some(entity))
    }

    fn apply_newer<E: SyncableEntity>(
        &self,
        record: &WireRecord,
        local: &mut E,
        remote_state: VersionState,
        config: &EntityConfig<E>,
        session: Option<&SyncSession>,
    ) -> MergeOutcome {
        let decoded = match decode_fields(record, config, session) {
            Ok(decoded) => decoded,
            Err(reason) => return MergeOutcome::Rejected(reason),
        };

        for column in config.protected_columns() {
            let (Some(mapping), Some(incoming)) = (config.field_for(column), decoded.get(column))
            else {
                continue;
            };
            if !mapping.read(local).is_empty_content() && incoming.is_empty_content() {
                return MergeOutcome::Rejected(RejectReason::ProtectedField {
                    column: column.to_string(),
                });
            }
        }

        if !config.conflict_rules().validate(local, &decoded) {
            return MergeOutcome::Rejected(RejectReason::Validator);
        }

        let mut candidate = local.clone();
        if let Err(reason) = apply_fields(&mut candidate, &decoded, config) {
            return MergeOutcome::Rejected(reason);
        }
        candidate.set_version_state(remote_state);
        *local = candidate;
        MergeOutcome::Updated
    }
}

/// Returns a copy of the record with encrypted columns opened.
///
/// Unprefixed values in encrypted columns are accepted as legacy
/// plaintext.
fn decode_fields<E: SyncableEntity>(
    record: &WireRecord,
    config: &EntityConfig<E>,
    session: Option<&SyncSession>,
) -> Result<WireRecord, RejectReason> {
    let cipher = session.and_then(SyncSession::cipher);
    let mut decoded = record.clone();

    for mapping in config.fields().iter().filter(|m| m.is_encrypted()) {
        let Some(sealed) = record
            .get(mapping.column())
            .and_then(WireValue::as_str)
            .filter(|s| FieldCipher::is_encrypted_string(s))
        else {
            continue;
        };
        let plain = cipher
            .ok_or_else(|| RejectReason::Decryption {
                column: mapping.column().to_string(),
            })?
            .decrypt_string(sealed)
            .map_err(|_| RejectReason::Decryption {
                column: mapping.column().to_string(),
            })?;
        decoded.insert(mapping.column(), plain);
    }

    Ok(decoded)
}

/// Copies every mapped column present in `decoded` into `entity`.
///
/// An empty value for a `reject_if_empty` column keeps the local value.
fn apply_fields<E: SyncableEntity>(
    entity: &mut E,
    decoded: &WireRecord,
    config: &EntityConfig<E>,
) -> Result<(), RejectReason> {
    for mapping in config.fields() {
        let Some(value) = decoded.get(mapping.column()) else {
            continue;
        };
        if mapping.is_reject_if_empty()
            && value.is_empty_content()
            && !mapping.read(entity).is_empty_content()
        {
            continue;
        }
        mapping.write(entity, value).map_err(|e| match e {
            SyncError::InvalidField { column, message } => {
                RejectReason::InvalidField { column, message }
            }
            other => RejectReason::InvalidField {
                column: mapping.column().to_string(),
                message: other.to_string(),
            },
        })?;
    }
    Ok(())
}
