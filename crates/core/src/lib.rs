#![forbid(unsafe_code)]

pub mod model;
pub mod progress;
pub mod time;
pub mod timer;

pub use progress::aggregate;
pub use time::{Clock, ManualClock};
pub use timer::{SessionTimer, TimerError, TimerState, TimerTick};
