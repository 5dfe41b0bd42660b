pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;
pub mod transaction;

pub use error::*;
pub use memory::*;
pub use postgres::*;
pub use traits::*;
pub use transaction::*;
