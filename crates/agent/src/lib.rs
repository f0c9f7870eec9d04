//! Chat orchestration for Parlance.
//!
//! A turn flows through three stages:
//!
//! 1. **Assemble**: system prompt, selected memories, retrieved document
//!    chunks, recent history and the new user input, in that order
//! 2. **Stream**: the provider's events are applied to an assistant
//!    placeholder as they arrive
//! 3. **Account**: final usage is recorded per model and priced
//!
//! [`ChatOrchestrator`] owns the message log and drives all three.

pub mod context;
pub mod orchestrator;
pub mod stream_event;

pub use context::{
    AssembledContext, AssemblyInput, AssemblyMetadata, ContextAssembler, LayerStats,
};
pub use orchestrator::{ChatOrchestrator, PendingTurn, TurnOptions, TurnReport};
pub use stream_event::{TurnEvent, TurnOutcome};
