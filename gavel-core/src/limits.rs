//! System-wide limits.
//!
//! Every buffer, queue and message has an explicit bound.

/// Maximum size of a single wire frame in bytes (16 MB).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Maximum number of log records in a single `AppendEntries` request.
pub const MAX_ENTRIES_PER_APPEND: usize = 1000;

/// Maximum size of a command payload in bytes (1 MB).
pub const MAX_COMMAND_BYTES: usize = 1024 * 1024;

/// Maximum number of nodes in a cluster.
pub const CLUSTER_SIZE_MAX: usize = 7;

/// Depth of the per-node handler queue (submissions, RPCs, timer events).
pub const HANDLER_QUEUE_DEPTH: usize = 1024;

/// Depth of the per-peer outbound send queue.
pub const SEND_QUEUE_DEPTH: usize = 1000;
