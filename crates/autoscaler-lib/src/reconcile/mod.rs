//! Reconciliation loop
//!
//! One logical control loop drives every tick: capture a snapshot, compute
//! capacity, plan, apply, advance drains and publish status. The loop owns
//! the node table and the in-flight launch list; nothing else mutates them.

mod r#loop;
mod table;

pub use r#loop::{DrainTransition, Reconciler, ReconcilerBuilder, TickReport};
pub use table::{NodeEntry, NodeTable};
