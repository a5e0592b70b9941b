//! Protocol module - frames, method tables, properties, and the frame
//! decoder.

pub mod constants;
mod demux;
mod frame;
mod method;
mod properties;

pub use demux::FrameDecoder;
pub use frame::{Frame, FramePayload};
pub use method::{method_name, Method};
pub use properties::BasicProperties;
