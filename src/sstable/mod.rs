//! SSTable (Sorted String Table) implementation
//!
//! Provides persistent, immutable, sorted storage as klog/vlog file pairs.

pub mod block;
pub mod bloom;
pub mod format;
pub mod reader;
pub mod writer;

pub use format::DEFAULT_BLOCK_SIZE;
pub use reader::{SsTableReader, TableCursor, TableEnv, TableIter};
pub use writer::{SsTableWriter, WriterOptions};
