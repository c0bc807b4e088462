//! Concurrent id to entity map with lazy hydration, eviction and redirects.
//!
//! Each id maps to an [`EntitySlot`]. A slot is locked per entity for the
//! duration of a command, never table-wide. A slot holds either a live entity
//! or a [`ProxyEntity`] that buffers commands while a remote copy is fetched.

use crate::codec::{EntityRegistry, StoredRecord};
use crate::entity::Entity;
use crate::envelope::CommandEnvelope;
use crate::error::MeshError;
use crate::message_id::MessageIdGenerator;
use crate::metrics::MeshMetrics;
use crate::persistence::{public_key, resource_key, Persistence};
use crate::types::EntityId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

type HydrateLocks = DashMap<EntityId, Arc<Mutex<()>>>;

/// Placeholder for an entity that is being cloned from its owner. Commands
/// arriving meanwhile are kept in arrival order and never applied to it.
#[derive(Debug, Default)]
pub struct ProxyEntity {
    pub buffered: Vec<CommandEnvelope>,
    /// The clone failed. Late arrivals go to the managing node instead.
    pub abandoned: bool,
}

pub enum SlotContent {
    Live(Box<dyn Entity>),
    Proxy(ProxyEntity),
}

impl SlotContent {
    pub fn entity(&self) -> Option<&dyn Entity> {
        match self {
            SlotContent::Live(entity) => Some(entity.as_ref()),
            SlotContent::Proxy(_) => None,
        }
    }

    pub fn entity_mut(&mut self) -> Option<&mut (dyn Entity + 'static)> {
        match self {
            SlotContent::Live(entity) => Some(entity.as_mut()),
            SlotContent::Proxy(_) => None,
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, SlotContent::Proxy(_))
    }
}

pub struct EntitySlot {
    tag: parking_lot::RwLock<Option<&'static str>>,
    content: Arc<Mutex<SlotContent>>,
}

impl std::fmt::Debug for EntitySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitySlot")
            .field("tag", &*self.tag.read())
            .finish_non_exhaustive()
    }
}

impl EntitySlot {
    fn live(entity: Box<dyn Entity>) -> Self {
        Self {
            tag: parking_lot::RwLock::new(Some(entity.type_tag())),
            content: Arc::new(Mutex::new(SlotContent::Live(entity))),
        }
    }

    fn proxy() -> Self {
        Self {
            tag: parking_lot::RwLock::new(None),
            content: Arc::new(Mutex::new(SlotContent::Proxy(ProxyEntity::default()))),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, SlotContent> {
        self.content.lock().await
    }

    /// Lock that can outlive the borrow of the slot, for work that carries
    /// on in another task.
    pub async fn lock_owned(&self) -> OwnedMutexGuard<SlotContent> {
        Arc::clone(&self.content).lock_owned().await
    }

    /// Type tag of the live entity, `None` while the slot is a proxy.
    pub fn type_tag(&self) -> Option<&'static str> {
        *self.tag.read()
    }

    pub fn is_proxy(&self) -> bool {
        self.type_tag().is_none()
    }

    /// Swap the proxy held in `content` for `entity` and hand back the
    /// commands it buffered. `content` must be this slot's locked content.
    pub fn promote(
        &self,
        content: &mut SlotContent,
        entity: Box<dyn Entity>,
    ) -> Vec<CommandEnvelope> {
        *self.tag.write() = Some(entity.type_tag());
        match std::mem::replace(content, SlotContent::Live(entity)) {
            SlotContent::Proxy(proxy) => proxy.buffered,
            SlotContent::Live(_) => Vec::new(),
        }
    }
}

pub struct EntityTable {
    server_id: i64,
    entries: DashMap<EntityId, Arc<EntitySlot>>,
    redirects: DashMap<EntityId, EntityId>,
    hydrate_locks: HydrateLocks,
    registry: Arc<EntityRegistry>,
    persistence: Arc<dyn Persistence>,
    local_ids: MessageIdGenerator,
    max_hops: usize,
    metrics: Arc<MeshMetrics>,
}

impl EntityTable {
    pub fn new(
        server_id: i64,
        registry: Arc<EntityRegistry>,
        persistence: Arc<dyn Persistence>,
        max_hops: usize,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            server_id,
            entries: DashMap::new(),
            redirects: DashMap::new(),
            hydrate_locks: DashMap::new(),
            registry,
            persistence,
            local_ids: MessageIdGenerator::new(),
            max_hops: max_hops.max(1),
            metrics,
        }
    }

    /// Whether `id` (or a redirect from it) is resident, proxies included.
    pub fn contains(&self, id: &EntityId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// In-memory lookup, following redirects recorded in memory.
    pub fn get(&self, id: &EntityId) -> Option<Arc<EntitySlot>> {
        let mut current = *id;
        for _ in 0..=self.max_hops {
            if let Some(slot) = self.entries.get(&current) {
                return Some(Arc::clone(slot.value()));
            }
            current = *self.redirects.get(&current)?.value();
        }
        None
    }

    /// Id `id` currently redirects to, if it was retired.
    pub fn redirect_target(&self, id: &EntityId) -> Option<EntityId> {
        self.redirects.get(id).map(|r| *r.value())
    }

    /// Look `id` up in memory, then on disk, following redirect tombstones.
    #[instrument(skip(self), fields(%id))]
    pub async fn resolve(&self, id: &EntityId) -> Result<Option<Arc<EntitySlot>>, MeshError> {
        if let Some(slot) = self.get(id) {
            return Ok(Some(slot));
        }

        let lock = self
            .hydrate_locks
            .entry(*id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let result = match self.get(id) {
            Some(slot) => Ok(Some(slot)),
            None => self.hydrate(*id).await,
        };
        self.hydrate_locks.remove(id);
        result
    }

    pub async fn resolve_required(&self, id: &EntityId) -> Result<Arc<EntitySlot>, MeshError> {
        self.resolve(id)
            .await?
            .ok_or(MeshError::ObjectNotFound { id: *id })
    }

    async fn hydrate(&self, id: EntityId) -> Result<Option<Arc<EntitySlot>>, MeshError> {
        let mut current = id;
        let mut visited = HashSet::new();
        loop {
            if !visited.insert(current) {
                warn!(%id, at = %current, "redirect cycle while hydrating");
                return Ok(None);
            }
            if visited.len() > self.max_hops + 1 {
                warn!(%id, hops = self.max_hops, "redirect chain too long");
                return Ok(None);
            }
            if current != id {
                if let Some(slot) = self.get(&current) {
                    self.redirects.insert(id, current);
                    return Ok(Some(slot));
                }
            }

            let Some(bytes) = self.persistence.read_bytes(&resource_key(&current)).await? else {
                return Ok(None);
            };
            match StoredRecord::from_bytes(&bytes)? {
                StoredRecord::Redirect { target } => {
                    debug!(from = %current, to = %target, "following redirect tombstone");
                    current = target;
                }
                StoredRecord::Entity(record) => {
                    let entity = self.registry.decode(&record)?;
                    let live_id = entity.id();
                    let slot = self.insert_slot(live_id, EntitySlot::live(entity));
                    if live_id != id {
                        self.redirects.insert(id, live_id);
                    }
                    debug!(%live_id, "hydrated entity from persistence");
                    return Ok(Some(slot));
                }
            }
        }
    }

    /// Insert unless something already lives at `id`; returns whatever is there.
    fn insert_slot(&self, id: EntityId, slot: EntitySlot) -> Arc<EntitySlot> {
        match self.entries.entry(id) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(vacant) => {
                self.count(&slot, 1);
                Arc::clone(vacant.insert(Arc::new(slot)).value())
            }
        }
    }

    fn count(&self, slot: &EntitySlot, delta: i64) {
        if slot.is_proxy() {
            self.metrics.proxies.add(delta);
        } else {
            self.metrics.entities.add(delta);
        }
    }

    /// Register an entity that already carries its id, replacing anything
    /// resident under that id.
    pub fn insert(&self, entity: Box<dyn Entity>) -> Result<Arc<EntitySlot>, MeshError> {
        let id = entity.id();
        if id.is_zero() {
            return Err(MeshError::malformed("entity has no id, use assign_id"));
        }
        let slot = Arc::new(EntitySlot::live(entity));
        self.count(&slot, 1);
        if let Some(previous) = self.entries.insert(id, Arc::clone(&slot)) {
            self.count(&previous, -1);
        }
        self.redirects.remove(&id);
        Ok(slot)
    }

    /// Stamp a fresh id on `entity` and register it.
    ///
    /// The id is scoped to this server, or carries server id 0 when the table
    /// has no server context. Fails with `AlreadyAssigned` if the entity
    /// already has an id, unless `force` is set.
    pub fn assign_id(
        &self,
        mut entity: Box<dyn Entity>,
        force: bool,
    ) -> Result<EntityId, MeshError> {
        let existing = entity.id();
        if !existing.is_zero() && !force {
            return Err(MeshError::AlreadyAssigned { id: existing });
        }
        let id = EntityId::from_parts(self.server_id, self.local_ids.next().0);
        entity.core_mut().id = id;
        self.insert(entity)?;
        Ok(id)
    }

    /// Put a proxy at `id` unless something is already resident there.
    pub fn install_proxy(&self, id: EntityId) -> Option<Arc<EntitySlot>> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let slot = EntitySlot::proxy();
                self.count(&slot, 1);
                Some(Arc::clone(vacant.insert(Arc::new(slot)).value()))
            }
        }
    }

    /// Register `entity` unless something already lives at its id, in which
    /// case the resident slot is returned and `entity` is dropped.
    pub fn insert_if_absent(&self, entity: Box<dyn Entity>) -> Result<Arc<EntitySlot>, MeshError> {
        let id = entity.id();
        if id.is_zero() {
            return Err(MeshError::malformed("entity has no id, use assign_id"));
        }
        Ok(self.insert_slot(id, EntitySlot::live(entity)))
    }

    /// Record that a proxy slot now holds a live entity.
    pub(crate) fn proxy_promoted(&self) {
        self.metrics.proxies.dec();
        self.metrics.entities.inc();
    }

    /// Drop `id` from memory. Persisted records are untouched.
    pub fn remove(&self, id: &EntityId) -> Option<Arc<EntitySlot>> {
        let (_, slot) = self.entries.remove(id)?;
        self.count(&slot, -1);
        Some(slot)
    }

    /// Drop `id` from memory and from persistence.
    pub async fn delete(&self, id: &EntityId) -> Result<(), MeshError> {
        self.remove(id);
        self.persistence.delete(&resource_key(id)).await?;
        self.persistence.delete(&public_key(id)).await
    }

    /// Persist the entity at `id`: the full record under `res/<id>` and a
    /// copy without access rules under `pub/<id>`. With `evict` the entity
    /// also leaves memory and is rehydrated on the next lookup.
    #[instrument(skip(self), fields(%id, evict))]
    pub async fn save(&self, id: &EntityId, evict: bool) -> Result<(), MeshError> {
        let slot = self.get(id).ok_or(MeshError::ObjectNotFound { id: *id })?;
        let content = slot.lock().await;
        let entity = content
            .entity()
            .ok_or_else(|| MeshError::malformed(format!("cannot save proxy {id}")))?;
        let live_id = entity.id();
        let full = StoredRecord::Entity(self.registry.encode(entity, true)?).to_bytes()?;
        let public = StoredRecord::Entity(self.registry.encode(entity, false)?).to_bytes()?;

        self.persistence
            .write_bytes(&resource_key(&live_id), &full)
            .await?;
        self.persistence
            .write_bytes(&public_key(&live_id), &public)
            .await?;
        if evict {
            self.remove(&live_id);
            debug!(%live_id, "evicted entity");
        }
        Ok(())
    }

    /// Move the entity at `old` to `new`, restamp its id, and leave a
    /// redirect tombstone at `old`. Lookups of either id afterwards yield the
    /// same slot.
    #[instrument(skip(self), fields(%old, %new))]
    pub async fn update_id_and_add_redirect(
        &self,
        old: EntityId,
        new: EntityId,
    ) -> Result<(), MeshError> {
        if self.entries.contains_key(&new) {
            return Err(MeshError::AlreadyAssigned { id: new });
        }
        let slot = self.resolve_required(&old).await?;
        {
            let mut content = slot.lock().await;
            let entity = content
                .entity_mut()
                .ok_or_else(|| MeshError::malformed(format!("cannot redirect proxy {old}")))?;
            let current = entity.id();
            entity.core_mut().id = new;
            self.entries.remove(&current);
            self.entries.insert(new, Arc::clone(&slot));
            if current != old {
                self.redirects.insert(current, new);
            }
        }
        self.redirects.insert(old, new);

        let tombstone = StoredRecord::Redirect { target: new }.to_bytes()?;
        self.persistence
            .write_bytes(&resource_key(&old), &tombstone)
            .await?;
        self.persistence.delete(&public_key(&old)).await?;
        self.save(&new, false).await
    }
}
