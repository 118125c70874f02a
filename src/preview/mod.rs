//! C10: the preview reverse proxy (§4.7). Starts a workspace's container on
//! demand for the first request that touches it, then forwards HTTP and
//! WebSocket traffic straight through to its dev server.

mod proxy;

pub use proxy::PreviewRouter;
