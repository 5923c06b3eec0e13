//! Error types for disk-representation and code-identity operations.
//!
//! All public functions in this crate return [`crate::Result<T>`], which uses
//! the [`enum@Error`] defined here. Note that a *missing* signing component is
//! not an error: component lookups return `Ok(None)` for absence.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for all operations in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed while opening or reading code storage.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unsupported Mach-O or universal binary.
    #[error("Invalid Mach-O: {0}")]
    MachO(String),

    /// The path exists but cannot be classified as any known storage shape.
    #[error("Unrecognized code format: {0}")]
    UnrecognizedFormat(PathBuf),

    /// Bundle directory layout is unrecognized, invalid, or unsuitable.
    #[error("Bad bundle format: {0}")]
    BadBundleFormat(String),

    /// The code has no main executable file.
    #[error("No main executable: {0}")]
    NoMainExecutable(String),

    /// Operation inapplicable or not supported for this type of code,
    /// e.g. requesting a writer from a read-only representation.
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// Signature container (SuperBlob) is malformed.
    #[error("Invalid signature data: {0}")]
    SignatureInvalid(String),

    /// The code object is not signed at all.
    #[error("Code object is not signed")]
    Unsigned,

    /// Signature verification found a mismatch between current and signed
    /// state. Raised by external validators, never produced silently.
    #[error("Signature check failed: {0}")]
    SignatureFailed(String),

    /// Code failed to satisfy a code requirement.
    #[error("Requirement not satisfied: {0}")]
    RequirementFailed(String),

    /// The code on disk no longer matches the identity it was cached under.
    #[error("Static code changed since identification")]
    StaticCodeChanged,

    /// Cannot find the code object on disk.
    #[error("Static code not found: {0}")]
    StaticCodeNotFound(String),

    /// Host has no guest with the requested attributes.
    #[error("No guest matches the given attributes")]
    NoSuchGuest,

    /// Ambiguous guest specification: multiple guests match the attributes.
    #[error("Multiple guests match the given attributes")]
    MultipleGuests,

    /// Guests cannot be located using this attribute set.
    #[error("Unsupported guest attributes: {0}")]
    UnsupportedGuestAttributes(String),

    /// The given code is not a guest of this host.
    #[error("Code is not a guest of this host")]
    NotAHost,

    /// Host/guest resolution would create a cycle or exceed the depth bound.
    #[error("Hosting chain is cyclic or too deep")]
    HostingCycle,

    /// The guest's code identity has been invalidated.
    #[error("Guest code identity has been invalidated")]
    GuestInvalid,

    /// Property list parsing failed (Info.plist, resource rules).
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),
}
