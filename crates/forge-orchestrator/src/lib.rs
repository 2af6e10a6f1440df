mod error;
pub mod executor;
pub mod extract;
pub mod planner;
pub mod prompts;
pub mod validate;

pub use error::{PlanError, TaskError, ValidationError};
pub use executor::*;
pub use extract::{extract_files, render_file_block};
pub use planner::*;
pub use validate::validate_plan;

#[cfg(test)]
pub(crate) mod testing;
