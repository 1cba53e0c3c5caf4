//! Shared utilities: error taxonomy and clocks

pub mod clock;
pub mod error;

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock, TickTiming, Ticker};
pub use error::{
    ConfigError, ErrorResponse, FormatError, InvalidTransition, SessionError, SessionResult,
    SourceFault, TeleopFault, WriteFault,
};
