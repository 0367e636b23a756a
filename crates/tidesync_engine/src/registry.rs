//! Entity registry: per-type table, field and conflict configuration.
//!
//! Each entity type registers one [`EntityConfig`] at startup. The registry
//! stores it twice: as a typed handle recovered by the generic engine
//! operations, and as an [`EntityDescriptor`] trait object for code that
//! only knows a table name (reconciliation, realtime routing).

use crate::entity::SyncableEntity;
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tidesync_protocol::{WireRecord, WireValue};
use uuid::Uuid;

type Getter<E> = Arc<dyn Fn(&E) -> WireValue + Send + Sync>;
type Setter<E> = Arc<dyn Fn(&mut E, &WireValue) -> SyncResult<()> + Send + Sync>;
type Validator<E> = Arc<dyn Fn(&E, &WireRecord) -> bool + Send + Sync>;
type ParentIdFn<E> = Arc<dyn Fn(&E) -> Option<String> + Send + Sync>;
type Factory<E> = Arc<dyn Fn(&str) -> E + Send + Sync>;

/// Maps one entity property to one remote column.
pub struct FieldMapping<E> {
    column: String,
    property: &'static str,
    encrypted: bool,
    reject_if_empty: bool,
    get: Getter<E>,
    set: Setter<E>,
}

impl<E> Clone for FieldMapping<E> {
    fn clone(&self) -> Self {
        Self {
            column: self.column.clone(),
            property: self.property,
            encrypted: self.encrypted,
            reject_if_empty: self.reject_if_empty,
            get: Arc::clone(&self.get),
            set: Arc::clone(&self.set),
        }
    }
}

impl<E> std::fmt::Debug for FieldMapping<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldMapping")
            .field("column", &self.column)
            .field("property", &self.property)
            .field("encrypted", &self.encrypted)
            .field("reject_if_empty", &self.reject_if_empty)
            .finish_non_exhaustive()
    }
}

impl<E: 'static> FieldMapping<E> {
    /// Creates a mapping from raw accessors.
    pub fn custom<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> WireValue + Send + Sync + 'static,
        S: Fn(&mut E, &WireValue) -> SyncResult<()> + Send + Sync + 'static,
    {
        Self {
            column: column.into(),
            property,
            encrypted: false,
            reject_if_empty: false,
            get: Arc::new(get),
            set: Arc::new(set),
        }
    }

    fn required<T, G, S>(
        column: impl Into<String>,
        property: &'static str,
        get: G,
        set: S,
        encode: fn(T) -> WireValue,
        decode: fn(&WireValue) -> Option<T>,
        expected: &'static str,
    ) -> Self
    where
        T: 'static,
        G: Fn(&E) -> T + Send + Sync + 'static,
        S: Fn(&mut E, T) + Send + Sync + 'static,
    {
        let column = column.into();
        let name = column.clone();
        Self::custom(
            column,
            property,
            move |entity| encode(get(entity)),
            move |entity, value| {
                let decoded = decode(value)
                    .ok_or_else(|| SyncError::invalid_field(&name, format!("expected {expected}")))?;
                set(entity, decoded);
                Ok(())
            },
        )
    }

    fn optional<T, G, S>(
        column: impl Into<String>,
        property: &'static str,
        get: G,
        set: S,
        encode: fn(T) -> WireValue,
        decode: fn(&WireValue) -> Option<T>,
        expected: &'static str,
    ) -> Self
    where
        T: 'static,
        G: Fn(&E) -> Option<T> + Send + Sync + 'static,
        S: Fn(&mut E, Option<T>) + Send + Sync + 'static,
    {
        let column = column.into();
        let name = column.clone();
        Self::custom(
            column,
            property,
            move |entity| get(entity).map_or(WireValue::Null, encode),
            move |entity, value| {
                if value.is_null() {
                    set(entity, None);
                    return Ok(());
                }
                let decoded = decode(value)
                    .ok_or_else(|| SyncError::invalid_field(&name, format!("expected {expected}")))?;
                set(entity, Some(decoded));
                Ok(())
            },
        )
    }

    /// Text column.
    pub fn text<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> String + Send + Sync + 'static,
        S: Fn(&mut E, String) + Send + Sync + 'static,
    {
        Self::required(column, property, get, set, WireValue::Text, WireValue::to_text, "text")
    }

    /// Nullable text column.
    pub fn optional_text<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> Option<String> + Send + Sync + 'static,
        S: Fn(&mut E, Option<String>) + Send + Sync + 'static,
    {
        Self::optional(column, property, get, set, WireValue::Text, WireValue::to_text, "text")
    }

    /// Integer column.
    pub fn integer<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> i64 + Send + Sync + 'static,
        S: Fn(&mut E, i64) + Send + Sync + 'static,
    {
        Self::required(column, property, get, set, WireValue::Integer, WireValue::as_i64, "integer")
    }

    /// Nullable integer column.
    pub fn optional_integer<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> Option<i64> + Send + Sync + 'static,
        S: Fn(&mut E, Option<i64>) + Send + Sync + 'static,
    {
        Self::optional(column, property, get, set, WireValue::Integer, WireValue::as_i64, "integer")
    }

    /// Floating-point column.
    pub fn double<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> f64 + Send + Sync + 'static,
        S: Fn(&mut E, f64) + Send + Sync + 'static,
    {
        Self::required(column, property, get, set, WireValue::Double, WireValue::as_f64, "double")
    }

    /// Nullable floating-point column.
    pub fn optional_double<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> Option<f64> + Send + Sync + 'static,
        S: Fn(&mut E, Option<f64>) + Send + Sync + 'static,
    {
        Self::optional(column, property, get, set, WireValue::Double, WireValue::as_f64, "double")
    }

    /// Boolean column.
    pub fn boolean<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> bool + Send + Sync + 'static,
        S: Fn(&mut E, bool) + Send + Sync + 'static,
    {
        Self::required(column, property, get, set, WireValue::Bool, WireValue::as_bool, "bool")
    }

    /// Nullable boolean column.
    pub fn optional_boolean<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> Option<bool> + Send + Sync + 'static,
        S: Fn(&mut E, Option<bool>) + Send + Sync + 'static,
    {
        Self::optional(column, property, get, set, WireValue::Bool, WireValue::as_bool, "bool")
    }

    /// Timestamp column, RFC 3339 on the wire.
    pub fn date<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> DateTime<Utc> + Send + Sync + 'static,
        S: Fn(&mut E, DateTime<Utc>) + Send + Sync + 'static,
    {
        Self::required(column, property, get, set, encode_date, decode_date, "RFC 3339 timestamp")
    }

    /// Nullable timestamp column.
    pub fn optional_date<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> Option<DateTime<Utc>> + Send + Sync + 'static,
        S: Fn(&mut E, Option<DateTime<Utc>>) + Send + Sync + 'static,
    {
        Self::optional(column, property, get, set, encode_date, decode_date, "RFC 3339 timestamp")
    }

    /// UUID column, hyphenated text on the wire.
    pub fn uuid<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> Uuid + Send + Sync + 'static,
        S: Fn(&mut E, Uuid) + Send + Sync + 'static,
    {
        Self::required(column, property, get, set, encode_uuid, decode_uuid, "UUID")
    }

    /// Nullable UUID column.
    pub fn optional_uuid<G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&E) -> Option<Uuid> + Send + Sync + 'static,
        S: Fn(&mut E, Option<Uuid>) + Send + Sync + 'static,
    {
        Self::optional(column, property, get, set, encode_uuid, decode_uuid, "UUID")
    }

    /// Enum column stored as its `Display` text and parsed back with `FromStr`.
    pub fn enumeration<T, G, S>(column: impl Into<String>, property: &'static str, get: G, set: S) -> Self
    where
        T: Display + FromStr + 'static,
        G: Fn(&E) -> T + Send + Sync + 'static,
        S: Fn(&mut E, T) + Send + Sync + 'static,
    {
        Self::required(
            column,
            property,
            get,
            set,
            |value: T| WireValue::Text(value.to_string()),
            |value| value.as_str().and_then(|s| s.parse().ok()),
            "enum variant",
        )
    }

    /// Nullable enum column.
    pub fn optional_enumeration<T, G, S>(
        column: impl Into<String>,
        property: &'static str,
        get: G,
        set: S,
    ) -> Self
    where
        T: Display + FromStr + 'static,
        G: Fn(&E) -> Option<T> + Send + Sync + 'static,
        S: Fn(&mut E, Option<T>) + Send + Sync + 'static,
    {
        Self::optional(
            column,
            property,
            get,
            set,
            |value: T| WireValue::Text(value.to_string()),
            |value| value.as_str().and_then(|s| s.parse().ok()),
            "enum variant",
        )
    }

    /// Marks the column as encrypted on the wire.
    #[must_use]
    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// An empty incoming value never overwrites a non-empty local one.
    #[must_use]
    pub fn reject_if_empty(mut self) -> Self {
        self.reject_if_empty = true;
        self
    }

    /// Remote column name.
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Entity property name.
    pub fn property(&self) -> &'static str {
        self.property
    }

    /// Returns true if the column is encrypted on the wire.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Returns true if empty incoming values are ignored for this column.
    pub fn is_reject_if_empty(&self) -> bool {
        self.reject_if_empty
    }

    /// Reads the property as a wire value.
    pub fn read(&self, entity: &E) -> WireValue {
        (self.get)(entity)
    }

    /// Writes a wire value into the property.
    pub fn write(&self, entity: &mut E, value: &WireValue) -> SyncResult<()> {
        (self.set)(entity, value)
    }
}

fn encode_date(value: DateTime<Utc>) -> WireValue {
    WireValue::Text(value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn decode_date(value: &WireValue) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.as_str()?.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn encode_uuid(value: Uuid) -> WireValue {
    WireValue::Text(value.hyphenated().to_string())
}

fn decode_uuid(value: &WireValue) -> Option<Uuid> {
    Uuid::parse_str(value.as_str()?.trim()).ok()
}

/// Per-type merge safeguards.
pub struct ConflictRules<E> {
    protect_non_empty_content: bool,
    protected_fields: BTreeSet<String>,
    validator: Option<Validator<E>>,
}

impl<E> Default for ConflictRules<E> {
    fn default() -> Self {
        Self {
            protect_non_empty_content: false,
            protected_fields: BTreeSet::new(),
            validator: None,
        }
    }
}

impl<E> ConflictRules<E> {
    /// Creates empty rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Promotes every `reject_if_empty` column to a protected field.
    #[must_use]
    pub fn protect_non_empty_content(mut self) -> Self {
        self.protect_non_empty_content = true;
        self
    }

    /// Rejects an update that would blank this non-empty column.
    #[must_use]
    pub fn protect_field(mut self, column: impl Into<String>) -> Self {
        self.protected_fields.insert(column.into());
        self
    }

    /// Runs `validator(local, incoming)` before applying a remote update;
    /// returning false rejects it.
    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&E, &WireRecord) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Returns true if `reject_if_empty` columns are protected.
    pub fn protects_non_empty_content(&self) -> bool {
        self.protect_non_empty_content
    }

    /// Explicitly protected columns.
    pub fn protected_fields(&self) -> &BTreeSet<String> {
        &self.protected_fields
    }

    /// Runs the validator; true when none is configured.
    pub fn validate(&self, local: &E, incoming: &WireRecord) -> bool {
        self.validator
            .as_ref()
            .map_or(true, |validator| validator(local, incoming))
    }
}

/// Declares that changes to an entity should bump its parent's version.
pub struct ParentRelation<E> {
    parent_type: &'static str,
    parent_id: ParentIdFn<E>,
    parent_table: OnceLock<String>,
}

impl<E> ParentRelation<E> {
    /// Creates a relation to parent type `P`.
    pub fn new<P, F>(parent_id: F) -> Self
    where
        P: SyncableEntity,
        F: Fn(&E) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            parent_type: P::ENTITY_TYPE,
            parent_id: Arc::new(parent_id),
            parent_table: OnceLock::new(),
        }
    }

    /// Parent entity type.
    pub fn parent_type(&self) -> &'static str {
        self.parent_type
    }

    /// Extracts the parent ID from a child, if it has one.
    pub fn parent_id(&self, child: &E) -> Option<String> {
        (self.parent_id)(child)
    }
}

/// Sync configuration of one entity type.
pub struct EntityConfig<E> {
    table_name: String,
    fields: Vec<FieldMapping<E>>,
    user_id_column: String,
    include_user_id: bool,
    conflict_rules: ConflictRules<E>,
    parent: Option<ParentRelation<E>>,
    factory: Option<Factory<E>>,
}

impl<E: SyncableEntity> EntityConfig<E> {
    /// Creates a configuration for `table_name` with no fields.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            fields: Vec::new(),
            user_id_column: "user_id".to_string(),
            include_user_id: false,
            conflict_rules: ConflictRules::default(),
            parent: None,
            factory: None,
        }
    }

    /// Appends a field mapping.
    #[must_use]
    pub fn field(mut self, mapping: FieldMapping<E>) -> Self {
        self.fields.push(mapping);
        self
    }

    /// Stamps the acting user into `column` and scopes reads by it.
    #[must_use]
    pub fn owned_by(mut self, column: impl Into<String>) -> Self {
        self.user_id_column = column.into();
        self.include_user_id = true;
        self
    }

    /// Sets the conflict rules.
    #[must_use]
    pub fn with_conflict_rules(mut self, rules: ConflictRules<E>) -> Self {
        self.conflict_rules = rules;
        self
    }

    /// Declares a parent relation.
    #[must_use]
    pub fn with_parent(mut self, relation: ParentRelation<E>) -> Self {
        self.parent = Some(relation);
        self
    }

    /// Sets the factory used to materialize remote-only rows.
    #[must_use]
    pub fn with_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str) -> E + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Remote table name.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Field mappings in declaration order.
    pub fn fields(&self) -> &[FieldMapping<E>] {
        &self.fields
    }

    /// Looks up the mapping for `column`.
    pub fn field_for(&self, column: &str) -> Option<&FieldMapping<E>> {
        self.fields.iter().find(|f| f.column == column)
    }

    /// Owner column, if the table is user-scoped.
    pub fn owner_column(&self) -> Option<&str> {
        self.include_user_id.then_some(self.user_id_column.as_str())
    }

    /// Conflict rules.
    pub fn conflict_rules(&self) -> &ConflictRules<E> {
        &self.conflict_rules
    }

    /// Parent relation, if any.
    pub fn parent(&self) -> Option<&ParentRelation<E>> {
        self.parent.as_ref()
    }

    /// Columns whose blanking rejects a whole update.
    pub fn protected_columns(&self) -> BTreeSet<&str> {
        let mut columns: BTreeSet<&str> = self
            .conflict_rules
            .protected_fields
            .iter()
            .map(String::as_str)
            .collect();
        if self.conflict_rules.protect_non_empty_content {
            columns.extend(
                self.fields
                    .iter()
                    .filter(|f| f.reject_if_empty)
                    .map(|f| f.column.as_str()),
            );
        }
        columns
    }

    /// Instantiates a blank entity with the given ID.
    pub fn create(&self, id: &str) -> SyncResult<E> {
        let factory = self.factory.as_ref().ok_or_else(|| SyncError::NoFactory {
            entity_type: E::ENTITY_TYPE.to_string(),
        })?;
        Ok(factory(id))
    }
}

/// Type-erased view of an [`EntityConfig`].
pub trait EntityDescriptor: Send + Sync {
    /// Entity type key.
    fn entity_type(&self) -> &'static str;
    /// Remote table name.
    fn table_name(&self) -> &str;
    /// Owner column, if the table is user-scoped.
    fn owner_column(&self) -> Option<&str>;
    /// Parent entity type, if the type declares one.
    fn parent_type(&self) -> Option<&'static str>;
    /// Mapped column names in declaration order.
    fn columns(&self) -> Vec<&str>;
}

impl<E: SyncableEntity> EntityDescriptor for EntityConfig<E> {
    fn entity_type(&self) -> &'static str {
        E::ENTITY_TYPE
    }

    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn owner_column(&self) -> Option<&str> {
        EntityConfig::owner_column(self)
    }

    fn parent_type(&self) -> Option<&'static str> {
        self.parent.as_ref().map(|p| p.parent_type)
    }

    fn columns(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.column.as_str()).collect()
    }
}

struct Registration {
    descriptor: Arc<dyn EntityDescriptor>,
    typed: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct RegistryInner {
    by_type: HashMap<&'static str, Registration>,
    by_table: HashMap<String, &'static str>,
}

/// All registered entity types.
#[derive(Default)]
pub struct EntityRegistry {
    inner: RwLock<RegistryInner>,
}

impl EntityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the configuration for entity type `E`.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if the type or its table is taken.
    pub fn register<E: SyncableEntity>(&self, config: EntityConfig<E>) -> SyncResult<()> {
        let mut inner = self.inner.write();
        if inner.by_type.contains_key(E::ENTITY_TYPE) {
            return Err(SyncError::AlreadyRegistered {
                what: format!("entity type {}", E::ENTITY_TYPE),
            });
        }
        if inner.by_table.contains_key(config.table_name()) {
            return Err(SyncError::AlreadyRegistered {
                what: format!("table {}", config.table_name()),
            });
        }

        let table = config.table_name().to_string();
        let config = Arc::new(config);
        inner.by_table.insert(table, E::ENTITY_TYPE);
        inner.by_type.insert(
            E::ENTITY_TYPE,
            Registration {
                descriptor: config.clone(),
                typed: config,
            },
        );
        Ok(())
    }

    /// Returns the typed configuration for `E`.
    pub fn config<E: SyncableEntity>(&self) -> SyncResult<Arc<EntityConfig<E>>> {
        let typed = self
            .inner
            .read()
            .by_type
            .get(E::ENTITY_TYPE)
            .map(|r| Arc::clone(&r.typed))
            .ok_or_else(|| SyncError::not_registered(E::ENTITY_TYPE))?;
        // Two types sharing an ENTITY_TYPE key would land here.
        typed
            .downcast::<EntityConfig<E>>()
            .map_err(|_| SyncError::not_registered(E::ENTITY_TYPE))
    }

    /// Returns the descriptor for an entity type.
    pub fn descriptor(&self, entity_type: &str) -> Option<Arc<dyn EntityDescriptor>> {
        self.inner
            .read()
            .by_type
            .get(entity_type)
            .map(|r| Arc::clone(&r.descriptor))
    }

    /// Returns the descriptor owning `table`.
    pub fn descriptor_for_table(&self, table: &str) -> Option<Arc<dyn EntityDescriptor>> {
        let inner = self.inner.read();
        let entity_type = inner.by_table.get(table)?;
        inner
            .by_type
            .get(entity_type)
            .map(|r| Arc::clone(&r.descriptor))
    }

    /// Returns all descriptors, ordered by table name.
    pub fn descriptors(&self) -> Vec<Arc<dyn EntityDescriptor>> {
        let mut all: Vec<_> = self
            .inner
            .read()
            .by_type
            .values()
            .map(|r| Arc::clone(&r.descriptor))
            .collect();
        all.sort_by(|a, b| a.table_name().cmp(b.table_name()));
        all
    }

    /// Resolves the parent table of a relation, caching the result.
    ///
    /// Resolution happens on first use so parents may register after
    /// their children.
    pub fn parent_table<E>(&self, relation: &ParentRelation<E>) -> Option<String> {
        if let Some(table) = relation.parent_table.get() {
            return Some(table.clone());
        }
        let table = self
            .descriptor(relation.parent_type)?
            .table_name()
            .to_string();
        Some(relation.parent_table.get_or_init(|| table).clone())
    }

    /// Returns true if `E` is registered.
    pub fn contains<E: SyncableEntity>(&self) -> bool {
        self.inner.read().by_type.contains_key(E::ENTITY_TYPE)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.inner.read().by_type.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
