pub mod action;
pub mod common;
pub mod element;
pub mod project;
pub mod user_context;

pub use action::*;
pub use common::*;
pub use element::*;
pub use project::*;
pub use user_context::*;
