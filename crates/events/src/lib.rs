//! Chunk dispatch notifications and the transport boundary that carries them.
//!
//! The engine treats the transport as an external collaborator: it only needs
//! to publish "this chunk is ready to be claimed" and let workers subscribe.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;

pub use bus::{NotificationBus, Subscription};
pub use envelope::ChunkReadyEvent;
pub use in_memory_bus::{BusError, InMemoryNotificationBus};
