//! Thin macro layer over `tracing` so log statements compile away entirely
//! when their level feature is disabled, instead of paying a runtime filter
//! check on every stimulus.

#[cfg(not(feature = "log_info"))]
#[macro_export]
macro_rules! info {
    ($($t:tt)*) => {};
}

#[cfg(not(feature = "log_warnings"))]
#[macro_export]
macro_rules! warn {
    ($($t:tt)*) => {};
}

#[cfg(not(feature = "log_errors"))]
#[macro_export]
macro_rules! error {
    ($($t:tt)*) => {};
}

#[cfg(not(feature = "log_debug"))]
#[macro_export]
macro_rules! debug {
    ($($t:tt)*) => {};
}

#[cfg(any(feature = "log_info", feature = "log_debug"))]
#[macro_export]
macro_rules! info {
    ($($t:tt)*) => {
        tracing::info!($($t)*);
    };
}

#[cfg(any(feature = "log_warnings", feature = "log_debug"))]
#[macro_export]
macro_rules! warn {
    ($($t:tt)*) => {
        tracing::warn!($($t)*);
    };
}

#[cfg(feature = "log_debug")]
#[macro_export]
macro_rules! debug {
    ($($t:tt)*) => {
        tracing::debug!($($t)*);
    };
}

#[cfg(any(feature = "log_errors", feature = "log_debug"))]
#[macro_export]
macro_rules! error {
    ($($t:tt)*) => {
        tracing::error!($($t)*);
    };
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn macros_compile_without_arguments() {
        info!("scheduler starting");
        debug!("scheduler starting");
        warn!("scheduler starting");
        error!("scheduler starting");
    }

    #[test]
    #[traced_test]
    fn macros_compile_with_arguments() {
        info!("dispatched {} tasks", 3);
        debug!("dispatched {} tasks", 3);
        warn!("dispatched {} tasks", 3);
        error!("dispatched {} tasks", 3);
    }
}
