//! Processing pipeline.
//!
//! Rules and recipes ([`registry`], [`processors`]), the per-task state
//! machine ([`lifecycle`]), progress reporting ([`progress`]) and the bounded
//! pool that runs tasks ([`worker_pool`]).

pub mod lifecycle;
pub mod processors;
pub mod progress;
pub mod registry;
pub mod worker_pool;

pub use lifecycle::TaskLifecycleManager;
pub use processors::{Recipe, RecipeOutcome, RecipeRequest, builtin_recipes};
pub use progress::{DurationProbe, FfprobeDurationProbe, ProgressTracker};
pub use registry::{ProcessorRegistry, ResolvedRule};
pub use worker_pool::WorkerPool;
