use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const REGION_SHIFT: u32 = 40;
const LOCATION_SHIFT: u32 = 16;
const REGION_MASK: u64 = (1 << 24) - 1;
const LOCATION_MASK: u64 = (1 << 24) - 1;
const SERVER_MASK: u64 = (1 << 16) - 1;

/// Number of bytes in the raw encoding of an [`EntityId`].
pub const ENTITY_ID_BYTES: usize = 16;

/// Globally unique address of an entity.
///
/// The `server_id` half packs `region:24 | location:24 | server_relative:16`,
/// the `local_id` half is assigned by the owning server. A `local_id` of zero
/// addresses the server itself; a `server_id` of zero marks an id minted
/// without server context (offline ids, self-addressed commands).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityId {
    pub server_id: i64,
    pub local_id: i64,
}

impl EntityId {
    /// The all-zero id carried by entities that have not been assigned yet.
    pub const ZERO: EntityId = EntityId {
        server_id: 0,
        local_id: 0,
    };

    pub fn new(region: u32, location: u32, server_relative: u16, local_id: i64) -> Self {
        Self {
            server_id: pack_server_id(region, location, server_relative),
            local_id,
        }
    }

    pub fn from_parts(server_id: i64, local_id: i64) -> Self {
        Self {
            server_id,
            local_id,
        }
    }

    /// Id of a server itself (`local_id == 0`).
    pub fn server(server_id: i64) -> Self {
        Self::from_parts(server_id, 0)
    }

    pub fn region(&self) -> u32 {
        ((self.server_id as u64 >> REGION_SHIFT) & REGION_MASK) as u32
    }

    pub fn location_in_region(&self) -> u32 {
        ((self.server_id as u64 >> LOCATION_SHIFT) & LOCATION_MASK) as u32
    }

    pub fn server_relative(&self) -> u16 {
        (self.server_id as u64 & SERVER_MASK) as u16
    }

    /// Region and location without the server part; two ids with the same
    /// value live in the same location.
    pub fn location_id(&self) -> i64 {
        (self.server_id as u64 & !SERVER_MASK) as i64
    }

    pub fn is_server(&self) -> bool {
        self.local_id == 0
    }

    /// Whether the id was minted without server context.
    pub fn is_local(&self) -> bool {
        self.server_id == 0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// The id of the server this entity lives on.
    pub fn full_server_id(&self) -> EntityId {
        Self::server(self.server_id)
    }

    pub fn as_bytes(&self) -> [u8; ENTITY_ID_BYTES] {
        let mut bytes = [0u8; ENTITY_ID_BYTES];
        bytes[..8].copy_from_slice(&self.server_id.to_be_bytes());
        bytes[8..].copy_from_slice(&self.local_id.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EntityIdError> {
        if bytes.len() != ENTITY_ID_BYTES {
            return Err(EntityIdError::InvalidLength { len: bytes.len() });
        }
        let mut server = [0u8; 8];
        let mut local = [0u8; 8];
        server.copy_from_slice(&bytes[..8]);
        local.copy_from_slice(&bytes[8..]);
        Ok(Self {
            server_id: i64::from_be_bytes(server),
            local_id: i64::from_be_bytes(local),
        })
    }
}

/// Pack the three server coordinates into a server id.
pub fn pack_server_id(region: u32, location: u32, server_relative: u16) -> i64 {
    (((region as u64 & REGION_MASK) << REGION_SHIFT)
        | ((location as u64 & LOCATION_MASK) << LOCATION_SHIFT)
        | server_relative as u64) as i64
}

/// Error returned when decoding an [`EntityId`] fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityIdError {
    #[error("entity id must be {ENTITY_ID_BYTES} bytes, got {len}")]
    InvalidLength { len: usize },
    #[error("malformed entity id string: {input}")]
    Malformed { input: String },
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{}", self.server_id, self.local_id)
    }
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || EntityIdError::Malformed {
            input: s.to_string(),
        };
        let (server, local) = s.split_once(':').ok_or_else(malformed)?;
        let server_id = u64::from_str_radix(server, 16).map_err(|_| malformed())? as i64;
        let local_id = local.parse::<i64>().map_err(|_| malformed())?;
        Ok(Self {
            server_id,
            local_id,
        })
    }
}
