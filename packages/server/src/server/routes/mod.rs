// HTTP routes
pub mod health;
pub mod stream;
pub mod submissions;
pub mod webhooks;

pub use health::*;
pub use stream::*;
pub use submissions::*;
pub use webhooks::*;
