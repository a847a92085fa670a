pub mod logging;

pub use logging::{init_console_logging, init_logging, LoggingGuard};
