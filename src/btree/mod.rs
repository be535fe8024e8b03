//! B-tree engine: cursors and mutators over the two kinds of btree SQLite
//! files use -- table btrees (keyed by an implicit 64-bit rowid) and index
//! btrees (keyed by an encoded record, with a trailing rowid tiebreak).
//! Interior pages route searches down; leaf pages hold the actual rows.

/// Cursor over a table btree: seek/scan forward and backward by rowid.
pub mod table;
/// Insert/delete on a table btree, including root-preserving split
/// propagation.
pub mod table_mutator;
/// Cursor and mutator over an index btree, plus the BINARY-collation
/// comparator used to order its keys.
pub mod index;
/// Flattened, non-seekable forward scan over every leaf page of a btree.
pub mod scanner;
