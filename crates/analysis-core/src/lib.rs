pub mod error;
pub mod position;
pub mod signal;
pub mod types;

pub use error::*;
pub use position::*;
pub use signal::*;
pub use types::*;
