pub mod buffer;
pub mod hub;
pub mod lifecycle;

pub use buffer::{Clock, FrameBuffer, SystemClock};
pub use hub::{BroadcastHub, ClientId, ClientSubscription};
pub use lifecycle::{IngestError, Relay, RelayError, RelayState, RunSummary};
