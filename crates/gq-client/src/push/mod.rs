//! Push channel to the backend's progress websocket

mod channel;

pub use channel::{PushChannel, PushEnvelope, PushEvent};
