// Kernel - shared infrastructure for the submission core

pub mod connection_registry;
pub mod deps;
pub mod event_bus;
pub mod signature;
pub mod sse;
pub mod storage;
pub mod test_dependencies;
pub mod traits;

pub use connection_registry::{
    ChannelSink, ConnectionRegistry, DeliveryError, EventFrame, EventSink, Registration,
};
pub use deps::{ClassifierAdapter, ServerDeps};
pub use event_bus::{EventBus, EventBusConfig};
pub use sse::LiveEventStream;
pub use storage::LocalObjectStorage;
pub use test_dependencies::TestDependencies;
pub use traits::*;
