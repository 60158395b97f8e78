//! Utility functions and helpers.

mod call_id;
mod logging;
mod shutdown;

pub use call_id::generate_call_id;
pub use logging::{LoggingError, init_logging};
pub use shutdown::{ShutdownSignal, wait_for_signal};
