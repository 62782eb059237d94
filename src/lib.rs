pub mod combine;
pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod moco;
pub mod spline;
pub mod utils;
pub mod volume;

pub use combine::{combine_matrices, CombineMode};
pub use config::{Interp, Metric, MetricSpec, MocoParams, Todo};
pub use engine::{RegistrationEngine, RegistrationMode, RegistrationRequest, TransformKind};
pub use error::MocoError;
pub use io::{ImageIo, MemoryIo};
pub use moco::{moco, run_dmri_moco, MocoOutput};
pub use volume::{Orientation, Volume3D, Volume4D};
