pub mod chat;
pub mod id;

pub use chat::ChatMessage;
pub use id::{generate_id, PeerDescriptor, PeerId, RoomId, UserId};
