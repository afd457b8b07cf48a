pub mod decoder;
pub mod frame;

pub use frame::{BufDef, BufferReturn, Dimension, FrameLenOffset, Handle, PixelFormat, StreamType, SuperBuf};
