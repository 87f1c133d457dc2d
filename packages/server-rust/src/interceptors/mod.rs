//! Stock interceptors.

pub mod logging;

pub use logging::{LoggingInInterceptor, LoggingOutInterceptor};
