pub mod access;
pub mod directive;
pub mod dispatch;
pub mod hierarchy;
pub mod layout;
pub mod tree;

pub use directive::*;
pub use dispatch::*;
pub use hierarchy::*;
pub use layout::*;
pub use tree::*;
