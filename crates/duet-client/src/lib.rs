pub mod coordinator;
pub mod error;
pub mod media;
pub mod peer;
pub mod runtime;
pub mod signaling;
pub mod types;

pub use coordinator::{CallCoordinator, Collaborators};
pub use error::CallError;
pub use media::{DisplaySink, MediaSource, MediaStream, SinkSlot, SyntheticMedia};
pub use peer::{LoopbackConnector, LoopbackNetwork, PeerChannel, PeerConnector};
pub use runtime::{spawn_coordinator, CallHandle};
pub use signaling::{RegistryEvent, SessionRegistry, WsRegistry};
pub use types::{CallPhase, CallRecord, CallSnapshot, CoordinatorConfig, PeerRole};
