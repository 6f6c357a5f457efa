//! # gshard-infer — Generation Runtime
//!
//! * **[`Sampler`]** — greedy, temperature, top-k, top-p over a seeded RNG.
//! * **[`Generator`]** — load a decoder-only checkpoint and decode tokens
//!   incrementally.

pub mod runtime;
pub mod sampler;

pub use runtime::Generator;
pub use sampler::{Sampler, SamplerConfig};
