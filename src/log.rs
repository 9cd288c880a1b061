//! Logging macros for DSRTOS
//!
//! Thin wrappers over defmt so kernel code logs unconditionally and the
//! binary only pays for it when the `defmt` feature is enabled. On
//! non-ARM builds (host tests) the macros compile to nothing, matching
//! the RTT transport which only exists on target.

/// Debug message
#[cfg(all(feature = "defmt", target_arch = "arm"))]
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { defmt::debug!($($arg)*) };
}

/// Info message
#[cfg(all(feature = "defmt", target_arch = "arm"))]
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { defmt::info!($($arg)*) };
}

/// Error message
#[cfg(all(feature = "defmt", target_arch = "arm"))]
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { defmt::error!($($arg)*) };
}

/// Trace message
#[cfg(all(feature = "defmt", target_arch = "arm"))]
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => { defmt::trace!($($arg)*) };
}

/// Warning message
#[cfg(all(feature = "defmt", target_arch = "arm"))]
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { defmt::warn!($($arg)*) };
}

// No-op versions when defmt is disabled or off-target
#[cfg(not(all(feature = "defmt", target_arch = "arm")))]
#[macro_export]
macro_rules! debug { ($($arg:tt)*) => {}; }
#[cfg(not(all(feature = "defmt", target_arch = "arm")))]
#[macro_export]
macro_rules! info { ($($arg:tt)*) => {}; }
#[cfg(not(all(feature = "defmt", target_arch = "arm")))]
#[macro_export]
macro_rules! error { ($($arg:tt)*) => {}; }
#[cfg(not(all(feature = "defmt", target_arch = "arm")))]
#[macro_export]
macro_rules! trace { ($($arg:tt)*) => {}; }
#[cfg(not(all(feature = "defmt", target_arch = "arm")))]
#[macro_export]
macro_rules! warn { ($($arg:tt)*) => {}; }
