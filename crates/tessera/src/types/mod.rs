mod entity_id;
mod message_id;
mod reference;

pub use entity_id::{pack_server_id, EntityId, EntityIdError, ENTITY_ID_BYTES};
pub use message_id::MessageId;
pub use reference::{RedundantReference, Reference};
