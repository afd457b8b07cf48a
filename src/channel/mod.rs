pub mod channel;
pub mod stream;

pub use self::channel::{Channel, ChannelAttr, ChannelCallback, ChannelType, LentFrames, NotifyMode};
pub use self::stream::{FrameSink, Stream, StreamAllocator, StreamCallback, StreamInfo};
