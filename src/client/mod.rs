//! Client side of the chat stream: decoding, view state, rendering and the
//! HTTP driver that ties them together.

pub mod consumer;
pub mod render;
pub mod session;

pub use consumer::{EventDecoder, StreamStatus, ViewState};
pub use render::{FrameThrottle, RenderedView, render};
pub use session::{ChatClient, ChatView, ClientError, StreamHandle, ViewSink};
