pub mod cmd_thread;
pub mod queue;
pub mod ringbuf;

pub use cmd_thread::{CmdKind, CmdThread, CmdWaker};
pub use queue::CommandQueue;
pub use self::ringbuf::ZslRing;
