// ============================================================================
// Entity Lock Module
// ============================================================================
//
// Per-entity read/write locks with callback-driven acquisition:
// - Readers are tracked per (client origin, client instance) with multiplicity
// - A writer is tracked per client origin and excludes every reader
// - Conflicting requests wait in a FIFO queue per entity
//
// Acquisition never blocks the caller. A grant hands the request's
// continuation back so the owner runs it inside its own execution order.
//
// ============================================================================

pub mod manager;

pub use manager::{LockError, LockManager};
