//! Protocol tags and their fixed wire strings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Every sub-protocol an engine speaks, including the two shared base
/// protocols. The wire representation is the fixed string table below;
/// all deployments must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolTag {
    Discover,
    Probe,
    RicartAgrawala,
    RicartAgrawalaExtended,
    SuzukiKasami,
    SuzukiKasamiExtended,
}

impl ProtocolTag {
    /// The exact string carried in [`crate::Envelope::protocol`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ProtocolTag::Discover => "dlm_discover",
            ProtocolTag::Probe => "dlm_probe",
            ProtocolTag::RicartAgrawala => "ricart_agrawala",
            ProtocolTag::RicartAgrawalaExtended => "ricart_agrawala_extended",
            ProtocolTag::SuzukiKasami => "suzuki_kasami",
            ProtocolTag::SuzukiKasamiExtended => "suzuki_kasami_extended",
        }
    }

    /// Inverse of [`ProtocolTag::as_str`]; `None` for tags outside the
    /// closed set.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "dlm_discover" => Some(ProtocolTag::Discover),
            "dlm_probe" => Some(ProtocolTag::Probe),
            "ricart_agrawala" => Some(ProtocolTag::RicartAgrawala),
            "ricart_agrawala_extended" => Some(ProtocolTag::RicartAgrawalaExtended),
            "suzuki_kasami" => Some(ProtocolTag::SuzukiKasami),
            "suzuki_kasami_extended" => Some(ProtocolTag::SuzukiKasamiExtended),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The algorithm variants an engine can be constructed with. A separate
/// type from [`ProtocolTag`] so the factory cannot be handed one of the
/// base sub-protocol tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockProtocol {
    RicartAgrawala,
    RicartAgrawalaExtended,
    SuzukiKasami,
    SuzukiKasamiExtended,
}

impl LockProtocol {
    /// The wire tag this variant speaks on.
    #[must_use]
    pub const fn tag(self) -> ProtocolTag {
        match self {
            LockProtocol::RicartAgrawala => ProtocolTag::RicartAgrawala,
            LockProtocol::RicartAgrawalaExtended => ProtocolTag::RicartAgrawalaExtended,
            LockProtocol::SuzukiKasami => ProtocolTag::SuzukiKasami,
            LockProtocol::SuzukiKasamiExtended => ProtocolTag::SuzukiKasamiExtended,
        }
    }

    /// Whether this variant activates the failure-detection extensions.
    #[must_use]
    pub const fn is_extended(self) -> bool {
        matches!(
            self,
            LockProtocol::RicartAgrawalaExtended | LockProtocol::SuzukiKasamiExtended
        )
    }
}

impl fmt::Display for LockProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_strings_round_trip() {
        for tag in [
            ProtocolTag::Discover,
            ProtocolTag::Probe,
            ProtocolTag::RicartAgrawala,
            ProtocolTag::RicartAgrawalaExtended,
            ProtocolTag::SuzukiKasami,
            ProtocolTag::SuzukiKasamiExtended,
        ] {
            assert_eq!(ProtocolTag::from_tag(tag.as_str()), Some(tag));
        }
        assert_eq!(ProtocolTag::from_tag("fipa_request"), None);
    }

    #[test]
    fn extended_variants() {
        assert!(!LockProtocol::RicartAgrawala.is_extended());
        assert!(LockProtocol::RicartAgrawalaExtended.is_extended());
        assert_eq!(
            LockProtocol::SuzukiKasamiExtended.tag().as_str(),
            "suzuki_kasami_extended"
        );
    }
}
