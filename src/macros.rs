//! Diagnostic macros.
//!
//! `dlog!` emits a debug line tagged with the calling module and line, and
//! compiles to nothing useful in release builds. `alog!` is the fatal path:
//! it logs at error level and panics in debug builds, and only logs in
//! release builds. `zassert!` runs `alog!` when its condition is false.
//!
//! `alog!` and `zassert!` take a plain format string and arguments, since the
//! same arguments are handed to `panic!`.

/// Log a debug diagnostic line (debug builds only).
///
/// ```
/// kern::dlog!("opened store {}", "Kern.sqlite");
/// ```
#[macro_export]
macro_rules! dlog {
    ($($arg:tt)+) => {
        if cfg!(debug_assertions) {
            $crate::__tracing::debug!(
                location = concat!(module_path!(), ":", line!()),
                $($arg)+
            );
        }
    };
}

/// Report a fatal condition.
#[macro_export]
macro_rules! alog {
    ($($arg:tt)+) => {{
        $crate::__tracing::error!(
            location = concat!(module_path!(), ":", line!()),
            fatal = true,
            $($arg)+
        );
        if cfg!(debug_assertions) {
            panic!($($arg)+);
        }
    }};
}

/// Report a fatal condition through `alog!` unless `$cond` holds.
#[macro_export]
macro_rules! zassert {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            $crate::alog!($($arg)+);
        }
    };
}
