//! # quire-doc
//!
//! The Document State Engine: a block-structured rich-text CRDT.
//!
//! - Blocks form an RGA sequence; each block owns an RGA of characters
//! - Inline formatting spans anchored on character ids
//! - Block kinds resolved last-writer-wins
//! - Causal delivery with a bounded dependency queue
//! - Delete-wins resolution for inserts inside concurrently deleted ranges
//!
//! ## Example
//!
//! ```rust
//! use quire_doc::{BlockKind, DocumentEngine, Operation};
//!
//! let mut alice = DocumentEngine::new("notes", "alice");
//! let block = alice
//!     .apply_local(Operation::InsertBlock { after: None, kind: BlockKind::Paragraph })
//!     .unwrap()
//!     .id;
//! let update = alice
//!     .apply_local(Operation::InsertText { block, offset: 0, text: "Hello".into() })
//!     .unwrap();
//!
//! let mut bob = DocumentEngine::new("notes", "bob");
//! for u in alice.log().iter().cloned() {
//!     bob.apply_remote(u).unwrap();
//! }
//! assert_eq!(bob.plain_text(), "Hello");
//! assert!(bob.contains(&update.id));
//! ```

pub mod block;
pub mod engine;
pub mod error;
pub mod log;
pub mod marks;
pub mod op;
pub mod pending;
mod rga;
pub mod state;
pub mod text;

pub use block::{Block, BlockId, BlockKind, BlockList};
pub use engine::{ApplyResult, BatchOutcome, DocumentEngine, EngineConfig};
pub use error::{DocError, Result};
pub use log::UpdateLog;
pub use marks::{FormatSpan, MarkType, TextRun};
pub use op::{Change, DocumentId, OpKind, Operation, Update};
pub use state::{DocumentState, RenderedBlock, RenderedDocument};
pub use text::{CharId, TextSequence};
