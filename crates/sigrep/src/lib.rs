//! Disk representations and code identity objects for a code-signing
//! engine.
//!
//! This crate abstracts over the physical shapes code takes on disk (thin
//! Mach-O, universal-binary slice, bundle, flat file) behind the
//! [`DiskRep`] capability contract, and over the runtime notion of code as
//! a host/guest identity graph ([`Code`] / [`StaticCode`]). It locates,
//! reads, and writes signing components; verifying them cryptographically
//! belongs to external collaborators plugged in through [`Validator`].

pub mod code;
pub mod codesign;
pub mod error;
pub mod macho;
pub mod rep;
pub mod requirement;
pub mod resources;

pub use code::{
    auto_locate_guest, AttributeValue, Code, CodeDriver, Flags, GuestAttributes, GuestRegistry,
    StaticCode, Validator, FLAG_BASIC_ONLY, FLAG_DEFAULT,
};
pub use codesign::SpecialSlot;
pub use error::Error;
pub use macho::{Architecture, Universal};
pub use rep::{
    best_file_guess, best_guess, best_guess_at_offset, best_guess_with, BundleRep, Context,
    DetachedRep, DiskRep, FileRep, MachORep, Writer, MONOLITHIC_PAGE_SIZE, SEGMENTED_PAGE_SIZE,
    WRITER_LAST_RESORT, WRITER_NO_GLOBAL,
};
pub use requirement::Requirements;
pub use resources::{ResourceBuilder, ResourceRules};

pub type Result<T> = std::result::Result<T, Error>;
