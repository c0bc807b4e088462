//! Ownership and access rules attached to every entity.
//!
//! Access is decided in three layers, first match wins:
//! 1. the owner is always allowed,
//! 2. per-requester overrides in `resource_access` (the requester itself, then
//!    the requester's server, so a grant to a server covers everything it hosts),
//! 3. the `general_access` bits for same-server, same-location and everyone.
//!
//! Modes are compared by level: a stored `WRITE` grant satisfies a `READ`
//! request, `CHANGE_PERMISSIONS` satisfies both.

use crate::types::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::BitOr;

/// Additive access bitmask.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct AccessMode(u8);

impl AccessMode {
    pub const NONE: AccessMode = AccessMode(0);
    pub const READ: AccessMode = AccessMode(1);
    pub const WRITE: AccessMode = AccessMode(2);
    pub const CHANGE_PERMISSIONS: AccessMode = AccessMode(4);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        AccessMode(bits & 0b111)
    }

    pub fn contains(&self, other: AccessMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Level comparison used for overrides: the stored grant must be at least
    /// as strong as the requested mode.
    pub fn satisfies(&self, requested: AccessMode) -> bool {
        self.0 >= requested.0
    }
}

impl BitOr for AccessMode {
    type Output = AccessMode;

    fn bitor(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 | rhs.0)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(AccessMode::READ) {
            parts.push("read");
        }
        if self.contains(AccessMode::WRITE) {
            parts.push("write");
        }
        if self.contains(AccessMode::CHANGE_PERMISSIONS) {
            parts.push("change_permissions");
        }
        if parts.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

/// Audience of a general access grant.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum AccessScope {
    SameServer,
    SameLocation,
    Everyone,
}

impl AccessScope {
    fn offset(self) -> u16 {
        match self {
            AccessScope::SameServer => 0,
            AccessScope::SameLocation => 3,
            AccessScope::Everyone => 6,
        }
    }
}

const SCOPE_READ: u16 = 0b01;
const SCOPE_WRITE: u16 = 0b10;

/// Packed general access bits: each scope holds a read and a write bit at
/// offsets 0 (same server), 3 (same location) and 6 (everyone).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct GeneralAccess(u16);

impl GeneralAccess {
    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Self {
        GeneralAccess(bits)
    }

    /// Replace the grant for `scope` with `mode` (only read/write apply).
    pub fn set(&mut self, scope: AccessScope, mode: AccessMode) {
        let offset = scope.offset();
        let mut bits = 0;
        if mode.contains(AccessMode::READ) {
            bits |= SCOPE_READ;
        }
        if mode.contains(AccessMode::WRITE) {
            bits |= SCOPE_WRITE;
        }
        self.0 = (self.0 & !((SCOPE_READ | SCOPE_WRITE) << offset)) | (bits << offset);
    }

    pub fn with(mut self, scope: AccessScope, mode: AccessMode) -> Self {
        self.set(scope, mode);
        self
    }

    /// Whether `scope` grants `mode`. A write bit also grants reads.
    pub fn allows(&self, scope: AccessScope, mode: AccessMode) -> bool {
        let bits = (self.0 >> scope.offset()) & (SCOPE_READ | SCOPE_WRITE);
        if mode == AccessMode::NONE {
            return true;
        }
        if mode.contains(AccessMode::CHANGE_PERMISSIONS) {
            return false;
        }
        if mode.contains(AccessMode::WRITE) {
            return bits & SCOPE_WRITE != 0;
        }
        bits != 0
    }
}

/// Ownership, overrides, general grants and subscribers of one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub owner: EntityId,
    pub general_access: GeneralAccess,
    pub resource_access: HashMap<EntityId, AccessMode>,
    pub subscribers: HashSet<EntityId>,
}

impl Access {
    pub fn new(owner: EntityId) -> Self {
        Self {
            owner,
            ..Default::default()
        }
    }

    /// Whether `requester` may use `mode` on the entity `resource`.
    pub fn is_allowed(&self, requester: &EntityId, mode: AccessMode, resource: &EntityId) -> bool {
        if *requester == self.owner {
            return true;
        }
        if let Some(granted) = self.resource_access.get(requester) {
            return granted.satisfies(mode);
        }
        if !requester.is_server() {
            if let Some(granted) = self.resource_access.get(&requester.full_server_id()) {
                return granted.satisfies(mode);
            }
        }

        let mut scopes = Vec::with_capacity(3);
        if requester.server_id == resource.server_id {
            scopes.push(AccessScope::SameServer);
        }
        if requester.location_id() == resource.location_id() {
            scopes.push(AccessScope::SameLocation);
        }
        scopes.push(AccessScope::Everyone);
        scopes
            .into_iter()
            .any(|scope| self.general_access.allows(scope, mode))
    }

    /// Grant `mode` to `requester`, replacing any previous override.
    pub fn authorize(&mut self, requester: EntityId, mode: AccessMode) {
        self.resource_access.insert(requester, mode);
    }

    pub fn revoke(&mut self, requester: &EntityId) -> Option<AccessMode> {
        self.resource_access.remove(requester)
    }

    pub fn set_general(&mut self, scope: AccessScope, mode: AccessMode) {
        self.general_access.set(scope, mode);
    }

    /// Returns `true` if the subscriber was newly added.
    pub fn subscribe(&mut self, subscriber: EntityId) -> bool {
        self.subscribers.insert(subscriber)
    }

    pub fn unsubscribe(&mut self, subscriber: &EntityId) -> bool {
        self.subscribers.remove(subscriber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> EntityId {
        EntityId::new(1, 1, 1, 100)
    }

    fn resource() -> EntityId {
        EntityId::new(1, 1, 1, 200)
    }

    #[test]
    fn owner_has_every_mode() {
        let access = Access::new(owner());
        for mode in [
            AccessMode::NONE,
            AccessMode::READ,
            AccessMode::WRITE,
            AccessMode::CHANGE_PERMISSIONS,
            AccessMode::READ | AccessMode::WRITE | AccessMode::CHANGE_PERMISSIONS,
        ] {
            assert!(access.is_allowed(&owner(), mode, &resource()));
        }
    }

    #[test]
    fn write_grant_satisfies_read_by_level() {
        let requester = EntityId::new(9, 9, 9, 1);
        let mut access = Access::new(owner());
        access.authorize(requester, AccessMode::WRITE);
        assert!(access.is_allowed(&requester, AccessMode::WRITE, &resource()));
        assert!(access.is_allowed(&requester, AccessMode::READ, &resource()));
        assert!(!access.is_allowed(&requester, AccessMode::CHANGE_PERMISSIONS, &resource()));
    }

    #[test]
    fn read_grant_does_not_allow_write() {
        let requester = EntityId::new(9, 9, 9, 1);
        let mut access = Access::new(owner());
        access.authorize(requester, AccessMode::READ);
        assert!(!access.is_allowed(&requester, AccessMode::WRITE, &resource()));
    }

    #[test]
    fn override_takes_precedence_over_general_bits() {
        let requester = EntityId::new(9, 9, 9, 1);
        let mut access = Access::new(owner());
        access.set_general(AccessScope::Everyone, AccessMode::WRITE);
        access.authorize(requester, AccessMode::NONE);
        assert!(!access.is_allowed(&requester, AccessMode::READ, &resource()));
    }

    #[test]
    fn server_grant_covers_hosted_ids() {
        let server = EntityId::server(EntityId::new(4, 4, 4, 0).server_id);
        let hosted = EntityId::from_parts(server.server_id, 77);
        let mut access = Access::new(owner());
        access.authorize(server, AccessMode::READ);
        assert!(access.is_allowed(&hosted, AccessMode::READ, &resource()));
        assert!(access.is_allowed(&server, AccessMode::READ, &resource()));
        assert!(!access.is_allowed(&hosted, AccessMode::WRITE, &resource()));
    }

    #[test]
    fn general_scopes() {
        let same_server = EntityId::from_parts(resource().server_id, 5);
        let same_location = EntityId::new(1, 1, 2, 5);
        let elsewhere = EntityId::new(3, 3, 3, 5);

        let mut access = Access::new(owner());
        access.set_general(AccessScope::SameServer, AccessMode::WRITE);
        access.set_general(AccessScope::SameLocation, AccessMode::READ);

        assert!(access.is_allowed(&same_server, AccessMode::WRITE, &resource()));
        assert!(access.is_allowed(&same_location, AccessMode::READ, &resource()));
        assert!(!access.is_allowed(&same_location, AccessMode::WRITE, &resource()));
        assert!(!access.is_allowed(&elsewhere, AccessMode::READ, &resource()));

        access.set_general(AccessScope::Everyone, AccessMode::READ);
        assert!(access.is_allowed(&elsewhere, AccessMode::READ, &resource()));
        assert!(!access.is_allowed(&elsewhere, AccessMode::CHANGE_PERMISSIONS, &resource()));
    }

    #[test]
    fn general_bit_offsets() {
        let bits = GeneralAccess::default()
            .with(AccessScope::SameServer, AccessMode::READ)
            .with(AccessScope::SameLocation, AccessMode::WRITE)
            .with(AccessScope::Everyone, AccessMode::READ | AccessMode::WRITE);
        assert_eq!(bits.bits(), 0b011_010_001);

        let cleared = bits.with(AccessScope::Everyone, AccessMode::NONE);
        assert_eq!(cleared.bits(), 0b000_010_001);
    }

    #[test]
    fn subscribers_are_a_set() {
        let mut access = Access::new(owner());
        let sub = EntityId::server(42);
        assert!(access.subscribe(sub));
        assert!(!access.subscribe(sub));
        assert!(access.unsubscribe(&sub));
        assert!(access.subscribers.is_empty());
    }

    #[test]
    fn mode_display() {
        assert_eq!(AccessMode::NONE.to_string(), "none");
        assert_eq!((AccessMode::READ | AccessMode::WRITE).to_string(), "read|write");
    }
}
