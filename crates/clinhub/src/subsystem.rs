//! Departmental subsystems connected to the hub.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A subsystem integrated through the hub.
///
/// Spokes (`Cpoe`, `Lis`, `Ris`, `Pharmacy`, `Dpi`) emit clinical events and
/// receive outbound commands. `Empi` and `Notification` are hub-side
/// collaborators that never originate workflow commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    /// Computerized physician order entry.
    Cpoe,
    /// Laboratory information system.
    Lis,
    /// Radiology information system.
    Ris,
    /// Pharmacy dispensing.
    Pharmacy,
    /// Patient record (dossier patient informatisé).
    Dpi,
    /// Master patient index.
    Empi,
    /// Notification collaborator.
    Notification,
}

impl Subsystem {
    /// All spokes, in a stable order.
    pub const SPOKES: [Subsystem; 5] = [
        Subsystem::Cpoe,
        Subsystem::Lis,
        Subsystem::Ris,
        Subsystem::Pharmacy,
        Subsystem::Dpi,
    ];

    /// Every known subsystem.
    pub const ALL: [Subsystem; 7] = [
        Subsystem::Cpoe,
        Subsystem::Lis,
        Subsystem::Ris,
        Subsystem::Pharmacy,
        Subsystem::Dpi,
        Subsystem::Empi,
        Subsystem::Notification,
    ];

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Cpoe => "cpoe",
            Subsystem::Lis => "lis",
            Subsystem::Ris => "ris",
            Subsystem::Pharmacy => "pharmacy",
            Subsystem::Dpi => "dpi",
            Subsystem::Empi => "empi",
            Subsystem::Notification => "notification",
        }
    }

    /// Returns `true` for departmental spokes.
    pub fn is_spoke(&self) -> bool {
        Self::SPOKES.contains(self)
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized subsystem name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown subsystem: {0}")]
pub struct UnknownSubsystem(pub String);

impl FromStr for Subsystem {
    type Err = UnknownSubsystem;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Subsystem::ALL
            .into_iter()
            .find(|subsystem| subsystem.as_str() == normalized)
            .ok_or_else(|| UnknownSubsystem(s.to_string()))
    }
}
