//! # gshard-train — Training Loop
//!
//! Optimisation for MoE transformers over packed batches:
//!
//! * **[`Trainer`]** — owns model + optimiser + schedule. One call to
//!   [`Trainer::step`] runs forward, the objective (cross-entropy + aux +
//!   z-loss), backward, gradient clipping, AdamW and schedule advancement.
//! * **[`LrScheduler`]** — warmup → cosine / linear / rsqrt / constant.

pub mod scheduler;
pub mod trainer;

pub use scheduler::{LrDecay, LrScheduler};
pub use trainer::{StepMetrics, Trainer, TrainerConfig};
