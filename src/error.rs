/*
 * Hypervisor Error Codes
 *
 * This module defines the error taxonomy shared by every subsystem of the
 * hypervisor core. Fallible operations return `Result<T>` and propagate
 * errors with `?`; conditions that cannot happen in a correct system
 * (an empty ready queue after scheduler init, a null register frame in a
 * context switch) panic with context instead of returning an error.
 */

use core::fmt;

/// Error codes propagated out of the hypervisor core.
///
/// The variants mirror the classic kernel error classes:
/// - precondition violations return `Invalid` or `Fail`
/// - transient conflicts (pause/resume refcount races) return `Again`
/// - missing resources or unknown IRQ numbers return `NotAvail`
/// - allocation failures at init return `NoMem`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Generic failure
    Fail,
    /// Invalid argument or invalid state transition
    Invalid,
    /// Resource not available (unknown IRQ, offline CPU, exhausted table)
    NotAvail,
    /// Out of memory
    NoMem,
    /// Transient conflict, the caller may retry
    Again,
    /// Bounded wait expired
    TimedOut,
    /// Device level I/O error
    Io,
    /// No such device
    NoDev,
    /// Operation not implemented by this port or chip
    NoSys,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Fail => "general failure",
            Error::Invalid => "invalid argument",
            Error::NotAvail => "resource not available",
            Error::NoMem => "out of memory",
            Error::Again => "try again",
            Error::TimedOut => "timed out",
            Error::Io => "i/o error",
            Error::NoDev => "no such device",
            Error::NoSys => "not implemented",
        };
        f.write_str(s)
    }
}

/// Crate wide result alias.
pub type Result<T> = core::result::Result<T, Error>;
