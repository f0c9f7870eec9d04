//! Context assembly for a single completion request.
//!
//! # Message order
//!
//! | # | Role | Source | Omitted when |
//! |---|------|--------|--------------|
//! | 1 | system | System prompt | blank |
//! | 2 | system | Selected memories | none selected |
//! | 3 | system | Retrieved document chunks | nothing retrieved |
//! | 4 | original | Recent conversation history | history empty |
//! | 5 | user | New input | rerun |

pub mod assembler;
pub mod token;

pub use assembler::{
    AssembledContext, AssemblyInput, AssemblyMetadata, ContextAssembler, LayerStats,
};
