//! Shared data types
//!
//! Chat messages and image frames owned by a session.

pub mod frame;
pub mod message;

pub use frame::{FrameError, ImageFrame, RGB_CHANNELS};
pub use message::{ChatMessage, Role};
