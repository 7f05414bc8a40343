use thiserror::Error;

/// Returned by [`ThreadLocal::try_with`](crate::ThreadLocal::try_with) when
/// the calling thread's storage is no longer available.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum AccessError {
    /// The thread is running its thread-local destructors.
    #[error("cannot access a thread-local value during or after its thread's destruction")]
    Destroyed,
}

/// Returned by [`configure`](crate::configure).
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ConfigError {
    /// A configuration was already installed, or the defaults were already
    /// read by the first use of the crate.
    #[error("configuration is already fixed")]
    AlreadyConfigured,
    #[error("initial table length must be a power of two >= {min}, got {got}")]
    InvalidTableLength { got: usize, min: usize },
    #[error("roster buffer length must be non-zero")]
    EmptyRosterBuffer,
}
