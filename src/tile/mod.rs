//! Tile identity and caching.
//!
//! A tile is a rectangular PNG render of a sub-region of one document part
//! at a given zoom and view. `desc` owns the wire-format value types, and
//! `cache` the per-document content-addressed store of finished renders
//! plus the in-flight render bookkeeping.

pub mod cache;
pub mod desc;

pub use cache::{StreamType, TileCache};
pub use desc::{TileCombined, TileDesc, TileWireId};
