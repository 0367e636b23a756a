//! Push engine: builds wire records and writes them to the remote store.

use crate::echo::EchoTracker;
use crate::entity::SyncableEntity;
use crate::error::{SyncError, SyncResult};
use crate::registry::EntityConfig;
use crate::remote::RemoteStore;
use crate::session::SyncSession;
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tidesync_protocol::{
    WireRecord, WireValue, DELETED_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN, VERSION_COLUMN,
};
use tracing::{debug, warn};

/// Returns the `updated_at` stamp for a write made now.
pub(crate) fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Builds the full wire record of an entity.
///
/// Encrypted columns are sealed with the session's field cipher. Without
/// one they are sent as plaintext and a warning is logged. `version`,
/// `deleted`, `updated_at` and, for owned tables, the owner column are
/// always stamped.
///
/// # Errors
///
/// `NoSession` for an owned table without a signed-in user, or a crypto
/// error if sealing fails.
pub fn build_record<E: SyncableEntity>(
    entity: &E,
    config: &EntityConfig<E>,
    session: Option<&SyncSession>,
) -> SyncResult<WireRecord> {
    let cipher = session.and_then(SyncSession::cipher);
    let mut record = WireRecord::new();

    for mapping in config.fields() {
        let value = mapping.read(entity);
        let value = match (mapping.is_encrypted(), value.to_text()) {
            (true, Some(plain)) => match cipher {
                Some(cipher) => WireValue::Text(cipher.encrypt_string(&plain)?),
                None => {
                    warn!(
                        table = config.table_name(),
                        column = mapping.column(),
                        "encryption unavailable, sending plaintext"
                    );
                    value
                }
            },
            _ => value,
        };
        record.insert(mapping.column(), value);
    }

    record.insert(ID_COLUMN, entity.id());
    record.insert(VERSION_COLUMN, WireValue::version(entity.version()));
    record.insert(DELETED_COLUMN, entity.is_deleted());
    record.insert(UPDATED_AT_COLUMN, now_stamp());

    if let Some(owner) = config.owner_column() {
        let session = session.ok_or(SyncError::NoSession)?;
        record.insert(owner, session.user_id());
    }

    Ok(record)
}

/// Builds the narrow tombstone update for an entity.
pub fn tombstone_record(id: &str, version: u64, deleted: bool) -> WireRecord {
    WireRecord::new()
        .with(ID_COLUMN, id)
        .with(VERSION_COLUMN, WireValue::version(version))
        .with(DELETED_COLUMN, deleted)
        .with(UPDATED_AT_COLUMN, now_stamp())
}

/// Writes records to the remote store, marking each as a pending echo.
pub struct PushEngine<R> {
    remote: Arc<R>,
    echo: Arc<EchoTracker>,
}

impl<R: RemoteStore> PushEngine<R> {
    /// Creates a push engine.
    pub fn new(remote: Arc<R>, echo: Arc<EchoTracker>) -> Self {
        Self { remote, echo }
    }

    /// Builds and upserts one entity.
    pub async fn push<E: SyncableEntity>(
        &self,
        entity: &E,
        config: &EntityConfig<E>,
        session: Option<&SyncSession>,
    ) -> SyncResult<()> {
        let record = build_record(entity, config, session)?;
        self.push_record(config.table_name(), record).await
    }

    /// Upserts an already-built record by ID.
    pub async fn push_record(&self, table: &str, record: WireRecord) -> SyncResult<()> {
        let id = record.id()?.to_string();
        self.echo.mark_as_pushed(&id, table);
        self.remote
            .upsert(table, std::slice::from_ref(&record), ID_COLUMN)
            .await?;
        debug!(table, entity_id = %id, version = ?record.version().ok(), "pushed record");
        Ok(())
    }

    /// Upserts entities in chunks of `batch_size`.
    ///
    /// A failed chunk is logged and skipped; the rest still go out.
    /// Returns the IDs the remote accepted.
    pub async fn push_batch<E: SyncableEntity>(
        &self,
        entities: &[E],
        config: &EntityConfig<E>,
        session: Option<&SyncSession>,
        batch_size: usize,
    ) -> Vec<String> {
        let table = config.table_name();
        let mut pushed = Vec::new();

        for chunk in entities.chunks(batch_size.max(1)) {
            let mut records = Vec::with_capacity(chunk.len());
            let mut ids = Vec::with_capacity(chunk.len());
            for entity in chunk {
                match build_record(entity, config, session) {
                    Ok(record) => {
                        records.push(record);
                        ids.push(entity.id().to_string());
                    }
                    Err(e) => {
                        warn!(table, entity_id = entity.id(), error = %e, "skipping entity that failed to build");
                    }
                }
            }
            if records.is_empty() {
                continue;
            }

            for id in &ids {
                self.echo.mark_as_pushed(id, table);
            }
            match self.remote.upsert(table, &records, ID_COLUMN).await {
                Ok(()) => pushed.extend(ids),
                Err(e) => {
                    warn!(table, batch = records.len(), error = %e, "batch push failed");
                }
            }
        }

        debug!(table, pushed = pushed.len(), total = entities.len(), "batch push finished");
        pushed
    }

    /// Writes only `version`, `deleted` and `updated_at` of an existing row.
    ///
    /// Returns false if no remote row has this ID.
    pub async fn update_tombstone(
        &self,
        id: &str,
        version: u64,
        deleted: bool,
        table: &str,
    ) -> SyncResult<bool> {
        let mut partial = tombstone_record(id, version, deleted);
        partial.remove(ID_COLUMN);

        self.echo.mark_as_pushed(id, table);
        let matched = self.remote.update(table, &partial, id).await?;
        debug!(table, entity_id = id, version, deleted, matched, "pushed tombstone update");
        Ok(matched > 0)
    }
}

impl<R> std::fmt::Debug for PushEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushEngine").finish_non_exhaustive()
    }
}
