//! PeerMesh Core Library
//!
//! Transport-free protocol logic for the peer mesh: identities, frames,
//! the rendezvous barrier, and the replicated shared state. Nothing here
//! opens connections; callers feed frames in and forward frames out.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod invariants;
pub mod meeting_point;
pub mod shared_state;

pub use config::{MeshConfig, RelayConfig};
pub use endpoint::{Endpoint, EndpointId};
pub use error::{Error, Result};
pub use frame::{Frame, FrameHandler};
pub use meeting_point::{MeetingEvent, MeetingPoint, Rendezvous, MEETING_FRAME};
pub use shared_state::{SharedState, SyncOutcome, SyncPoint, SYNC_FRAME, UPDATE_FRAME};
