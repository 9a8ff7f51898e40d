// HTTP middleware
pub mod files;
pub mod owner;

pub use files::*;
pub use owner::*;
