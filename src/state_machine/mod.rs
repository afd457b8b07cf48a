//! Camera state machine.
//!
//! API calls and asynchronous events are funneled through one worker thread
//! that owns the camera's [`CameraControl`]. The current [`State`] picks the
//! handler for every command.

pub mod command;
pub mod control;
pub mod machine;
pub mod states;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{ApiKind, ApiRequest, ApiResult, CameraCommand, HalEvent, ResultPayload};
pub use control::CameraControl;
pub use machine::{EventSender, StateMachine};
pub use states::{State, StateHandler};
