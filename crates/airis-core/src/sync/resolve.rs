//! Last-write-wins conflict resolution

use chrono::{DateTime, Utc};

/// Which side of a conflict survives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    TakeRemote,
}

/// Compare the local and remote `updated_at` of one entity
///
/// The remote version wins only when it is strictly newer; equal timestamps
/// keep the local version. An entity unknown locally always takes the remote.
pub fn resolve(local: Option<DateTime<Utc>>, remote: DateTime<Utc>) -> Resolution {
    match local {
        Some(local) if remote <= local => Resolution::KeepLocal,
        _ => Resolution::TakeRemote,
    }
}
