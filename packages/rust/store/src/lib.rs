//! File-backed knowledge store and sync cursor store.
//!
//! The [`KnowledgeStore`] owns the on-disk tree of questions, answers and
//! notes: header parsing and rendering, id allocation, and source-scoped scans.
//! The [`JsonCursorStore`] records the last synchronized timestamp per source.
//!
//! ```text
//! <root>/
//! ├── questions/q_0001.md
//! ├── answers/a_0001.md
//! ├── notes/n_0001.md
//! ├── inbox/raw/<stamp>_<file>
//! ├── inbox/analyzed/<source>/<stamp>_analyzed.json
//! └── source_config.json
//! ```

pub mod cursor;
pub mod header;
pub mod layout;
pub mod units;

pub use cursor::{JsonCursorStore, SyncCursorStore};
pub use layout::StoreLayout;
pub use units::KnowledgeStore;
