// Common test utilities
#![allow(dead_code)]

pub mod harness;
pub mod sse;

pub use harness::*;
pub use sse::*;
