/// Compression of persisted status documents
pub mod codec;

/// Snapshot, commit and rollback around job mutations
pub mod commit_loop;

/// The generation state machine
pub mod state_machine;

/// Per-job lock, commands and ticks
pub mod keeper;

/// Registry of every job and the reconciliation ticker
pub mod controller;
