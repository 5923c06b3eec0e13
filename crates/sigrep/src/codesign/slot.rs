//! Special slots: well-known identifiers for signature components.

use std::fmt;

use super::constants::*;

/// A fixed, well-known identifier for a particular signing component.
///
/// Slots key the entries of a signature SuperBlob. Representations fetch and
/// store component bytes by slot; the bytes themselves are opaque to this
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpecialSlot {
    /// The code directory: hashed manifest of the code's content.
    CodeDirectory,
    /// Info.plist seal.
    Info,
    /// Internal requirement set.
    Requirements,
    /// Resource directory seal.
    ResourceDir,
    /// Application-specific data.
    Application,
    /// Entitlements.
    Entitlements,
    /// Representation-specific data.
    RepSpecific,
    /// DER-encoded entitlements.
    DerEntitlements,
    /// Alternate code directory (additional hash algorithm), index 0..5.
    AlternateCodeDirectory(u32),
    /// CMS signature over the code directory.
    Signature,
    /// Notarization ticket.
    Ticket,
}

impl SpecialSlot {
    /// The raw slot number used in SuperBlob indexes.
    pub fn raw(self) -> u32 {
        match self {
            SpecialSlot::CodeDirectory => CSSLOT_CODEDIRECTORY,
            SpecialSlot::Info => CSSLOT_INFOSLOT,
            SpecialSlot::Requirements => CSSLOT_REQUIREMENTS,
            SpecialSlot::ResourceDir => CSSLOT_RESOURCEDIR,
            SpecialSlot::Application => CSSLOT_APPLICATION,
            SpecialSlot::Entitlements => CSSLOT_ENTITLEMENTS,
            SpecialSlot::RepSpecific => CSSLOT_REP_SPECIFIC,
            SpecialSlot::DerEntitlements => CSSLOT_DER_ENTITLEMENTS,
            SpecialSlot::AlternateCodeDirectory(n) => CSSLOT_ALTERNATE_CODEDIRECTORIES + n,
            SpecialSlot::Signature => CSSLOT_SIGNATURESLOT,
            SpecialSlot::Ticket => CSSLOT_TICKETSLOT,
        }
    }

    /// Map a raw slot number back to a slot, if it is one we know.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            CSSLOT_CODEDIRECTORY => Some(SpecialSlot::CodeDirectory),
            CSSLOT_INFOSLOT => Some(SpecialSlot::Info),
            CSSLOT_REQUIREMENTS => Some(SpecialSlot::Requirements),
            CSSLOT_RESOURCEDIR => Some(SpecialSlot::ResourceDir),
            CSSLOT_APPLICATION => Some(SpecialSlot::Application),
            CSSLOT_ENTITLEMENTS => Some(SpecialSlot::Entitlements),
            CSSLOT_REP_SPECIFIC => Some(SpecialSlot::RepSpecific),
            CSSLOT_DER_ENTITLEMENTS => Some(SpecialSlot::DerEntitlements),
            CSSLOT_SIGNATURESLOT => Some(SpecialSlot::Signature),
            CSSLOT_TICKETSLOT => Some(SpecialSlot::Ticket),
            n if (CSSLOT_ALTERNATE_CODEDIRECTORIES
                ..CSSLOT_ALTERNATE_CODEDIRECTORIES + CSSLOT_ALTERNATE_CODEDIRECTORY_MAX)
                .contains(&n) =>
            {
                Some(SpecialSlot::AlternateCodeDirectory(
                    n - CSSLOT_ALTERNATE_CODEDIRECTORIES,
                ))
            }
            _ => None,
        }
    }
}

impl fmt::Display for SpecialSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecialSlot::CodeDirectory => write!(f, "code directory"),
            SpecialSlot::Info => write!(f, "Info.plist"),
            SpecialSlot::Requirements => write!(f, "requirements"),
            SpecialSlot::ResourceDir => write!(f, "resource directory"),
            SpecialSlot::Application => write!(f, "application"),
            SpecialSlot::Entitlements => write!(f, "entitlements"),
            SpecialSlot::RepSpecific => write!(f, "rep-specific"),
            SpecialSlot::DerEntitlements => write!(f, "DER entitlements"),
            SpecialSlot::AlternateCodeDirectory(n) => write!(f, "alternate code directory #{n}"),
            SpecialSlot::Signature => write!(f, "signature"),
            SpecialSlot::Ticket => write!(f, "ticket"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        let slots = [
            SpecialSlot::CodeDirectory,
            SpecialSlot::Info,
            SpecialSlot::Requirements,
            SpecialSlot::ResourceDir,
            SpecialSlot::Application,
            SpecialSlot::Entitlements,
            SpecialSlot::RepSpecific,
            SpecialSlot::DerEntitlements,
            SpecialSlot::AlternateCodeDirectory(0),
            SpecialSlot::AlternateCodeDirectory(4),
            SpecialSlot::Signature,
            SpecialSlot::Ticket,
        ];
        for slot in slots {
            assert_eq!(SpecialSlot::from_raw(slot.raw()), Some(slot));
        }
    }

    #[test]
    fn test_unknown_raw() {
        assert_eq!(SpecialSlot::from_raw(0x9999), None);
        // past the alternate code directory window
        assert_eq!(SpecialSlot::from_raw(CSSLOT_ALTERNATE_CODEDIRECTORIES + 5), None);
    }

    #[test]
    fn test_ordering_follows_raw_values() {
        // BTreeMap keyed by SpecialSlot must serialize components in raw order
        let mut slots = vec![
            SpecialSlot::Signature,
            SpecialSlot::CodeDirectory,
            SpecialSlot::AlternateCodeDirectory(0),
            SpecialSlot::Requirements,
        ];
        slots.sort();
        let raws: Vec<u32> = slots.iter().map(|s| s.raw()).collect();
        let mut sorted = raws.clone();
        sorted.sort();
        assert_eq!(raws, sorted);
    }
}
