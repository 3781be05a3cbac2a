//! Mediator error taxonomy.
//!
//! Every failure inside the mediator is one of five kinds, and none of them
//! is fatal to the host. See `optee::error_to_smc_return` for how each kind
//! is reported to the guest.

use thiserror::Error;

/// Errors raised while mediating a secure-world call.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TeeError {
    /// Malformed size, alignment or attribute combination.
    #[error("invalid parameter: {0}")]
    Param(&'static str),
    /// Guest address does not resolve to ordinary read/write RAM.
    #[error("guest address {0:#x} is not valid RAM")]
    Translation(u64),
    /// Allocation failure or a per-domain limit was hit.
    #[error("out of resources: {0}")]
    Resource(&'static str),
    /// Disallowed command or a context/region lookup miss.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// No usable firmware or mediator initialization failure.
    #[error("firmware: {0}")]
    Firmware(&'static str),
}

pub type TeeResult<T> = Result<T, TeeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn translation_error_shows_address() {
        let err = TeeError::Translation(0x4000_1000);
        assert_eq!(err.to_string(), "guest address 0x40001000 is not valid RAM");
    }

    #[test]
    fn kinds_are_distinct() {
        assert_ne!(TeeError::Param("x"), TeeError::Protocol("x"));
    }
}
