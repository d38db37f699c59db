//! Keyboard/mouse capture and the fixed-rate control dispatch loop.

pub mod capture;
pub mod dispatch;

pub use capture::{
    Button, InputCapture, InputSnapshot, Key, KeyOutcome, MouseButton, ReservedAction,
};
pub use dispatch::{DISPATCH_PERIOD, DispatchLoop, TickSink, scale_delta};
