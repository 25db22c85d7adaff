// Re-export all model types
pub use self::errors::*;

mod errors;
