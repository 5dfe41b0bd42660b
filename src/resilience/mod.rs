pub mod circuit_breaker;
pub mod error;
pub mod retry;

pub use circuit_breaker::*;
pub use error::*;
pub use retry::*;
