//! Live document events for the study portal.
//!
//! [`EventStreamClient`] keeps a server-sent events connection to the
//! notification service open and hands every decoded [`StreamEvent`] to a
//! [`StreamHandler`]. [`DocumentEventReducer`] filters those events to the
//! portal's package, drops duplicates and classifies them into
//! [`DomainEvent`]s.

pub mod event;
pub mod reducer;
pub mod sse;
pub mod stream;

// Re-exports for convenience
pub use event::{DocumentUploaded, DocumentVoted, DomainEvent, EventPayload, StreamEvent, StreamEventKind};
pub use reducer::{DocumentEventReducer, ReducerConfig, WarmUp};
pub use stream::{
    ConnectionState, ConnectionStatus, Error, EventStreamClient, StreamConfig, StreamHandler,
};
