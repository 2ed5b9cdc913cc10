//! Shared identifiers, hybrid time, and catalog enums.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Tablet (shard) identifier as assigned by the catalog.
pub type TabletId = String;
/// Catalog object identifier (table, namespace, type, ...).
pub type ObjectId = String;
/// Database OID used to scope a restore to one YSQL database.
pub type DbOid = i64;

/// Raised when raw bytes cannot be decoded into a 16-byte id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} id: expected 16 bytes, got {len}")]
pub struct IdDecodeError {
    /// Id family that failed to decode.
    pub kind: &'static str,
    /// Observed byte length.
    pub len: usize,
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random id.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// All-zero id.
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Builds an id from its raw 16 bytes.
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Decodes an id, requiring exactly 16 bytes.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, IdDecodeError> {
                Uuid::from_slice(bytes).map(Self).map_err(|_| IdDecodeError {
                    kind: $kind,
                    len: bytes.len(),
                })
            }

            /// Raw id bytes.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// True for the all-zero id.
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of one restoration; never reused.
    RestorationId,
    "restoration"
);
uuid_id!(
    /// Identifier of a distributed snapshot.
    SnapshotId,
    "snapshot"
);
uuid_id!(
    /// Identifier of a snapshot schedule. Nil means "no schedule".
    ScheduleId,
    "schedule"
);

/// Hybrid logical timestamp: physical microseconds shifted left by
/// [`HybridTime::LOGICAL_BITS`], logical counter in the low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HybridTime(u64);

impl HybridTime {
    /// Width of the logical component.
    pub const LOGICAL_BITS: u32 = 12;
    /// Sentinel for "no valid time".
    pub const INVALID: Self = Self(u64::MAX);
    /// Smallest representable time.
    pub const MIN: Self = Self(0);

    /// Wraps a raw encoded value.
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Builds a time from physical microseconds with a zero logical part.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros << Self::LOGICAL_BITS)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self::from_micros(micros)
    }

    /// Raw encoded value.
    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// Physical component in microseconds.
    pub const fn physical_micros(self) -> u64 {
        self.0 >> Self::LOGICAL_BITS
    }

    /// False for [`HybridTime::INVALID`].
    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return f.write_str("<invalid>");
        }
        write!(
            f,
            "{{ physical: {} logical: {} }}",
            self.physical_micros(),
            self.0 & ((1 << Self::LOGICAL_BITS) - 1)
        )
    }
}

/// Catalog row type. The discriminant is the key-prefix byte in the
/// sys catalog log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SysRowEntryType {
    /// User table.
    Table = 1,
    /// Tablet of a table.
    Tablet = 2,
    /// Cluster-wide config.
    ClusterConfig = 3,
    /// Namespace / database.
    Namespace = 4,
    /// User-defined type.
    UdType = 5,
    /// Role.
    Role = 6,
    /// Snapshot.
    Snapshot = 7,
    /// Snapshot schedule.
    SnapshotSchedule = 12,
    /// Snapshot restoration.
    SnapshotRestoration = 14,
}

impl SysRowEntryType {
    /// Key-prefix byte.
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Inverse of [`SysRowEntryType::as_byte`].
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::Table,
            2 => Self::Tablet,
            3 => Self::ClusterConfig,
            4 => Self::Namespace,
            5 => Self::UdType,
            6 => Self::Role,
            7 => Self::Snapshot,
            12 => Self::SnapshotSchedule,
            14 => Self::SnapshotRestoration,
            _ => return None,
        })
    }
}

/// Operation-wide state shared by snapshots and restorations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    /// Snapshot is being taken.
    Creating,
    /// Restore RPCs remain outstanding.
    Restoring,
    /// Every tablet finished.
    Complete,
    /// Being deleted.
    Deleting,
    /// Terminally failed.
    Failed,
}

impl OperationState {
    /// True for states that never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Per-tablet progress of one restoration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TabletState {
    /// Not yet dispatched, or redispatch pending after failover.
    Pending,
    /// Restore RPC in flight. Never persisted.
    Dispatched,
    /// Tablet restored.
    Done,
    /// Last RPC failed; see the stored error.
    Failed,
}
