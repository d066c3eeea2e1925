// src/macros.rs

//! Level-tagged logging shims.
//!
//! Each macro forwards to the matching `tracing` macro when the `logging`
//! feature is enabled. With the feature off the crate stays quiet except
//! for errors, which still reach stderr so operational failures are never
//! swallowed silently.

macro_rules! log_error {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        tracing::error!($($arg)*);
        #[cfg(not(feature = "logging"))]
        eprintln!($($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        tracing::warn!($($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        tracing::info!($($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        tracing::debug!($($arg)*);
    }};
}

pub(crate) use {log_debug, log_error, log_info, log_warn};
