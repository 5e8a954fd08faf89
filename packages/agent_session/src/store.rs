//! EntityStore: cache of domain entities addressable by id, type, and
//! (category, key), with change subscriptions.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::SessionError;

/// A cached domain entity. Envelope fields are typed; everything else the
/// producer sent is kept in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            created_at: now,
            updated_at: now,
            version: None,
            metadata: Value::Null,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Build an entity from a response payload. `default_type` applies when
    /// the payload carries no `type`.
    pub fn from_payload(payload: &Value, default_type: &str) -> Result<Self, SessionError> {
        let Value::Object(obj) = payload else {
            return Err(SessionError::MalformedMessage(format!(
                "entity payload is not an object: {payload}"
            )));
        };
        if !obj.get("id").is_some_and(Value::is_string) {
            return Err(SessionError::MalformedMessage(
                "entity payload has no string id".to_string(),
            ));
        }
        let mut obj = obj.clone();
        if !obj.get("type").is_some_and(Value::is_string) {
            obj.insert("type".to_string(), Value::String(default_type.to_string()));
        }
        serde_json::from_value(Value::Object(obj))
            .map_err(|e| SessionError::MalformedMessage(format!("entity payload: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    pub kind: ChangeKind,
    pub entity: Entity,
}

type ChangeCallback = Arc<dyn Fn(&EntityChange) + Send + Sync>;

/// A change subscription. With no type and id criteria it matches every
/// entity.
#[derive(Clone)]
pub struct EntitySubscription {
    pub id: String,
    pub entity_types: Option<HashSet<String>>,
    pub entity_ids: Option<HashSet<String>>,
    callback: ChangeCallback,
}

impl EntitySubscription {
    pub fn new<F>(id: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&EntityChange) + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            entity_types: None,
            entity_ids: None,
            callback: Arc::new(callback),
        }
    }

    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    fn matches(&self, entity: &Entity) -> bool {
        self.entity_types
            .as_ref()
            .is_none_or(|t| t.contains(&entity.entity_type))
            && self.entity_ids.as_ref().is_none_or(|i| i.contains(&entity.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    CreatedAt,
    UpdatedAt,
    Id,
    /// A domain field; entities lacking it sort first.
    Field(String),
}

type EntityFilter = Arc<dyn Fn(&Entity) -> bool + Send + Sync>;

/// Query for `EntityStore::get_entities`. Criteria combine with AND;
/// `offset` applies before `limit`.
#[derive(Clone, Default)]
pub struct EntityQuery {
    pub entity_type: Option<String>,
    pub ids: Option<HashSet<String>>,
    filter: Option<EntityFilter>,
    pub sort: Option<(SortKey, bool)>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl EntityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Entity) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn sort_by(mut self, key: SortKey, descending: bool) -> Self {
        self.sort = Some((key, descending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn accepts(&self, entity: &Entity) -> bool {
        self.entity_type
            .as_ref()
            .is_none_or(|t| *t == entity.entity_type)
            && self.ids.as_ref().is_none_or(|ids| ids.contains(&entity.id))
            && self.filter.as_ref().is_none_or(|f| f(entity))
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x.cmp(y),
                _ => a.to_string().cmp(&b.to_string()),
            },
        },
    }
}

fn compare_by(key: &SortKey, a: &Entity, b: &Entity) -> Ordering {
    match key {
        SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
        SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortKey::Id => a.id.cmp(&b.id),
        SortKey::Field(name) => compare_values(a.field(name), b.field(name)),
    }
}

#[derive(Default)]
struct StoreState {
    entities: HashMap<String, Entity>,
    /// category -> key -> entity id
    categories: HashMap<String, HashMap<String, String>>,
    subscriptions: Vec<EntitySubscription>,
}

impl StoreState {
    fn upsert(&mut self, entity: Entity) -> EntityChange {
        let kind = if self.entities.contains_key(&entity.id) {
            ChangeKind::Updated
        } else {
            ChangeKind::Added
        };
        self.entities.insert(entity.id.clone(), entity.clone());
        EntityChange { kind, entity }
    }

    fn watchers_for(&self, entity: &Entity) -> Vec<ChangeCallback> {
        self.subscriptions
            .iter()
            .filter(|s| s.matches(entity))
            .map(|s| s.callback.clone())
            .collect()
    }
}

/// The session's entity cache. Every write is atomic per entity and
/// subscribers are notified after the write is visible.
#[derive(Default)]
pub struct EntityStore {
    state: RwLock<StoreState>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `entity` under `(category, key)`. The entity is also reachable
    /// by id and type.
    pub fn add_entity_to_category(&self, category: &str, key: &str, entity: Entity) {
        let (change, watchers) = {
            let mut state = self.state.write();
            state
                .categories
                .entry(category.to_string())
                .or_default()
                .insert(key.to_string(), entity.id.clone());
            let change = state.upsert(entity);
            let watchers = state.watchers_for(&change.entity);
            (change, watchers)
        };
        debug!(category, key, id = %change.entity.id, "entity stored in category");
        notify(&watchers, &change);
    }

    pub fn get_entity_from_category(&self, category: &str, key: &str) -> Option<Entity> {
        let state = self.state.read();
        let id = state.categories.get(category)?.get(key)?;
        state.entities.get(id).cloned()
    }

    pub fn get_entity(&self, id: &str) -> Option<Entity> {
        self.state.read().entities.get(id).cloned()
    }

    pub fn get_entities_by_type(&self, entity_type: &str) -> Vec<Entity> {
        self.get_entities(&EntityQuery::new().of_type(entity_type))
    }

    /// Entities matching `query`. Unsorted results are ordered by id so
    /// paging is stable.
    pub fn get_entities(&self, query: &EntityQuery) -> Vec<Entity> {
        let mut found: Vec<Entity> = self
            .state
            .read()
            .entities
            .values()
            .filter(|e| query.accepts(e))
            .cloned()
            .collect();

        match &query.sort {
            Some((key, descending)) => {
                found.sort_by(|a, b| {
                    let ord = compare_by(key, a, b).then_with(|| a.id.cmp(&b.id));
                    if *descending { ord.reverse() } else { ord }
                });
            }
            None => found.sort_by(|a, b| a.id.cmp(&b.id)),
        }

        let iter = found.into_iter().skip(query.offset);
        match query.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    /// Register a change subscription, replacing any with the same id.
    pub fn subscribe_to_entities(&self, subscription: EntitySubscription) {
        let mut state = self.state.write();
        state.subscriptions.retain(|s| s.id != subscription.id);
        state.subscriptions.push(subscription);
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut state = self.state.write();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.id != subscription_id);
        state.subscriptions.len() != before
    }

    /// Drop the category view. Entities stay reachable by id and type.
    pub fn clear_category(&self, category: &str) {
        if self.state.write().categories.remove(category).is_some() {
            debug!(category, "category cleared");
        }
    }

    /// Insert or replace by id.
    pub fn set_entity(&self, entity: Entity) {
        let (change, watchers) = {
            let mut state = self.state.write();
            let change = state.upsert(entity);
            let watchers = state.watchers_for(&change.entity);
            (change, watchers)
        };
        notify(&watchers, &change);
    }

    /// Remove by id along with every category key pointing at it.
    pub fn remove_entity(&self, id: &str) -> Option<Entity> {
        let (entity, watchers) = {
            let mut state = self.state.write();
            let entity = state.entities.remove(id)?;
            for keys in state.categories.values_mut() {
                keys.retain(|_, target| target.as_str() != id);
            }
            let watchers = state.watchers_for(&entity);
            (entity, watchers)
        };
        let change = EntityChange {
            kind: ChangeKind::Removed,
            entity: entity.clone(),
        };
        notify(&watchers, &change);
        Some(entity)
    }

    /// Apply a server-pushed entity unless the cached copy is newer.
    /// Returns whether the push was applied.
    pub fn reconcile(&self, entity: Entity) -> bool {
        let (change, watchers) = {
            let mut state = self.state.write();
            if let (Some(incoming), Some(current)) = (
                entity.version,
                state.entities.get(&entity.id).and_then(|e| e.version),
            ) {
                if incoming < current {
                    debug!(id = %entity.id, incoming, current, "ignoring stale entity update");
                    return false;
                }
            }
            let change = state.upsert(entity);
            let watchers = state.watchers_for(&change.entity);
            (change, watchers)
        };
        notify(&watchers, &change);
        true
    }

    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entities, categories and subscriptions. Each cached entity is
    /// reported `Removed` to its watchers first.
    pub fn clear(&self) {
        let removed: Vec<(Entity, Vec<ChangeCallback>)> = {
            let mut state = self.state.write();
            let removed = state
                .entities
                .values()
                .map(|entity| (entity.clone(), state.watchers_for(entity)))
                .collect();
            state.entities.clear();
            state.categories.clear();
            state.subscriptions.clear();
            removed
        };
        debug!(count = removed.len(), "entity store cleared");
        for (entity, watchers) in removed {
            let change = EntityChange {
                kind: ChangeKind::Removed,
                entity,
            };
            notify(&watchers, &change);
        }
    }
}

fn notify(watchers: &[ChangeCallback], change: &EntityChange) {
    for watcher in watchers {
        watcher(change);
    }
}
