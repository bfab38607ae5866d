//! CollabCanvas Core Library
//!
//! State-synchronization engine for a collaborative canvas: the local
//! document store, soft edit locks, presence, outbound write scheduling,
//! layering, and the remote room abstraction they sync against.

pub mod canvas;
pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod ids;
pub mod layering;
pub mod layout;
pub mod lock;
pub mod presence;
pub mod protocol;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod shapes;
pub mod ws;

pub use canvas::CanvasDocument;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::SyncConfig;
pub use error::{ConfigError, LockError, RemoteError, RemoteResult};
pub use feed::{ChangeFeedListener, FeedReport};
pub use ids::{IdGenerator, SequentialIds, UuidIds};
pub use layering::ReorderDirection;
pub use lock::{LockManager, UpsertOutcome};
pub use presence::{AvatarState, PresenceRecord, PresenceRegistry, PresenceStatus};
pub use remote::{MemoryRoom, PresenceCollection, RemoteRoom, ShapeCollection, SnapshotDocument};
pub use scheduler::{LockField, OutboundWrite, ShapeWrite, WriteScheduler};
pub use session::{CanvasSession, Intent, RemoteOp, SessionDriver, SessionEvent, SessionHandle};
pub use shapes::{ClientId, LockDescriptor, Shape, ShapeId, ShapeKind, ShapePatch};
pub use ws::WsRoom;
