//! Chat executor for the trellis engine: orchestrates turns over the
//! tree-structured session model, streams LLM responses into nodes with
//! cooperative cancellation, and coordinates the undo history around
//! breakpoints.
//!
//! Providers implement [`LlmClient`], storage backends implement
//! [`PersistenceAdapter`]; the engine is embeddable anywhere those two
//! exist.

pub mod client;
pub mod error;
pub mod events;
pub mod executor;
pub mod persistence;
pub mod preview;
pub mod stream;

pub use client::{ChatRequest, LlmClient, LlmError, LlmErrorKind, StreamChunk};
pub use error::{EngineError, Result};
pub use events::EngineEvent;
pub use executor::{ChatExecutor, SessionState};
pub use persistence::{MemoryPersistence, PersistenceAdapter, PersistenceError};
pub use preview::{ContextPreviewData, PreviewMessage};
pub use stream::{ChunkBatcher, Flush};
