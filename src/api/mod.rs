// HTTP and WebSocket surface

pub mod timeline;
pub mod websocket;

pub use timeline::{create_timeline_router, TimelineAppState};
pub use websocket::{create_ws_router, WsAppState};
