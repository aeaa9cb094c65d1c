pub use genlock_if::err::PllError;

pub type Result<T = ()> = core::result::Result<T, PllError>;

/// Rejects non-finite or non-positive frequencies before any hardware access.
pub(crate) fn check_frequency(freq: f64, what: &'static str) -> Result {
    if freq.is_finite() && freq > 0.0 {
        Ok(())
    } else {
        error!("Invalid {what}: {freq}");
        Err(PllError::InvalidArgument(what))
    }
}
