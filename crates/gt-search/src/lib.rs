//! # gt-search
//!
//! Search space definitions and the search strategies that propose trials.
//!
//! Spaces are parsed once from JSON trees with embedded `hp_*` markers into a
//! typed [`SearchSpace`]. Strategies (grid, random, adaptive) implement the
//! [`Search`] trait the engine drives.

mod search;
mod space;

pub use search::{build_search, AdaptiveSearch, GridSearch, RandomSearch, Search};
pub use space::{Distribution, Point, SearchSpace, SearchVariable, SpaceNode};
