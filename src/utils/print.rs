//! Helper macros for logging (console printing).

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// ks_trace!("recovman"; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! ks_trace {
    ($prefix:expr; $fmt_str:literal) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// ks_debug!("recovman"; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! ks_debug {
    ($prefix:expr; $fmt_str:literal) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// ks_info!("recovman"; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! ks_info {
    ($prefix:expr; $fmt_str:literal) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// ks_warn!("recovman"; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! ks_warn {
    ($prefix:expr; $fmt_str:literal) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// ks_error!("recovman"; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! ks_error {
    ($prefix:expr; $fmt_str:literal) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `KeystoneError`
/// containing the string.
///
/// Example:
/// ```no_run
/// let e = logged_err!("recovman"; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal) => {{
        ks_error!($prefix; $fmt_str);
        Err(KeystoneError(format!(concat!("({}) ", $fmt_str), $prefix)))
    }};

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {{
        ks_error!($prefix; $fmt_str, $($fmt_arg)*);
        Err(KeystoneError(format!(
            concat!("({}) ", $fmt_str),
            $prefix,
            $($fmt_arg)*
        )))
    }};
}
