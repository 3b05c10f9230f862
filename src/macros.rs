#![allow(unused_macros)]

// Logging goes through `tracing` under the `rseme` target when the feature is
// on. Without it the arguments are still type-checked but nothing is emitted.

macro_rules! debug {
    ($($t:tt)*) => {
        drm_log!(debug, $($t)*)
    }
}

macro_rules! info {
    ($($t:tt)*) => {
        drm_log!(info, $($t)*)
    }
}

macro_rules! warn {
    ($($t:tt)*) => {
        drm_log!(warn, $($t)*)
    }
}

macro_rules! error {
    ($($t:tt)*) => {
        drm_log!(error, $($t)*)
    }
}

macro_rules! drm_log {
    ($level:ident, $($t:tt)*) => {{
        #[cfg(feature = "tracing")]
        {
            tracing::$level!(target: "rseme", $($t)*)
        }
        #[cfg(not(feature = "tracing"))]
        {
            if false {
                let _ = format_args!($($t)*);
            }
        }
    }};
}
