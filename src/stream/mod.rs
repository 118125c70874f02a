//! C9: the streaming response processor. Parses model output into tag
//! events as it arrives, applies the resulting file operations at stream
//! completion, sequences dependency installation and container restart,
//! and emits the SSE event sequence in §6.

mod context;
mod errors;
mod events;
mod file_ops;
mod processor;
mod registry;
mod tag_parser;

pub use errors::{StreamError, StreamResult};
pub use events::StreamEvent;
pub use file_ops::{apply_operations, ApplyOutcome};
pub use processor::{ChatStreamRequest, StreamProcessor};
pub use tag_parser::{ParseEvent, TagParser};
