//! Persistence collaborators: history sink and room catalog

pub mod message_store;
pub mod traits;

pub use message_store::InMemoryMessageStore;
pub use traits::{MessageSink, RoomCatalog, StoredMessage};
