//! Domain events.
//!
//! Events are immutable facts about what happened in the counting workflow.
//! Storage and delivery belong to the surrounding application; this crate
//! only defines the contract.

pub mod event;

pub use event::Event;
