//! Text generation
//!
//! Word-level Markov models trained per member and guild, the cache that
//! holds them, and a character-level scrambler for short texts.

mod cache;
mod model;

pub use cache::{CacheKey, ModelCache};
pub use model::{Gibberish, MarkovModel};
