//! Filter chains and the stages they are composed of.
//!
//! - [`chain`]: `FilterChain`, the `Stage` / `Consumer` seams and the consume outcome
//! - [`handler`]: closure-backed consumer for plain messages
//! - [`specification`]: per-endpoint recipe for building chains
//! - [`stages`]: the built-in tower layers

pub mod chain;
pub mod handler;
pub mod specification;
pub mod stages;

pub use chain::{ConsumeOutcome, ConsumeResponse, ConsumeService, Consumer, FilterChain, Stage};
pub use handler::HandlerConsumer;
pub use specification::{EndpointSpecification, PipeSpecification};
