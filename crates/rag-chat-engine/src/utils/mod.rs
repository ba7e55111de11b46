pub mod error;
pub mod limiters;
pub mod text;
pub mod token_estimator;

pub use error::{ChatError, ChatResult, ErrorKind};
pub use token_estimator::estimate_tokens;
