//! The text-search machinery: the radix word store, shared postings and
//! the two-level key/position iterators.

pub mod iterator;
pub mod or_proximity;
pub mod postings;
pub mod proximity;
pub mod radix;

pub use iterator::{PositionRange, TermIterator, TextIterator};
pub use or_proximity::OrProximityIterator;
pub use postings::{FieldMask, Position, Postings, SharedPostings};
pub use proximity::ProximityIterator;
pub use radix::{CountOp, RadixTree};
