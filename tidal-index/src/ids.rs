//! Identifiers shared by every layer of the collector
//!
//! Object, store and device identities are 128-bit values that are globally
//! unique and never reinterpreted. Store indices are local handles that only
//! make sense inside one daemon.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Length in bytes of every globally unique identifier
pub const UNIQUE_ID_LEN: usize = 16;

macro_rules! unique_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; UNIQUE_ID_LEN]);

        impl $name {
            /// Generate a fresh random identifier
            pub fn generate() -> Self {
                Self(rand::random())
            }

            pub const fn from_bytes(bytes: [u8; UNIQUE_ID_LEN]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; UNIQUE_ID_LEN] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Short form is enough to tell objects apart in logs
                write!(f, "{}", &self.to_hex()[..8])
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::Borrowed(ValueRef::Blob(&self.0)))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let blob = value.as_blob()?;
                let bytes: [u8; UNIQUE_ID_LEN] =
                    blob.try_into().map_err(|_| FromSqlError::InvalidBlobSize {
                        expected_size: UNIQUE_ID_LEN,
                        blob_size: blob.len(),
                    })?;
                Ok(Self(bytes))
            }
        }
    };
}

unique_id!(
    /// Object identity, independent of name or path
    Oid
);

unique_id!(
    /// Store identity, global counterpart of [`SIndex`]
    Sid
);

unique_id!(
    /// Device (replica) identity
    Did
);

/// Local handle of a store, stable for the lifetime of the daemon's database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SIndex(pub u32);

impl fmt::Display for SIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl ToSql for SIndex {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.0)))
    }
}

impl FromSql for SIndex {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_i64()?;
        u32::try_from(raw)
            .map(SIndex)
            .map_err(|_| FromSqlError::OutOfRange(raw))
    }
}

/// Facet of an object that is versioned independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Cid {
    Meta,
    Content,
}

impl Cid {
    pub fn as_i64(self) -> i64 {
        match self {
            Cid::Meta => 0,
            Cid::Content => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Cid::Meta),
            1 => Some(Cid::Content),
            _ => None,
        }
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cid::Meta => write!(f, "meta"),
            Cid::Content => write!(f, "content"),
        }
    }
}

impl ToSql for Cid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_i64()))
    }
}

impl FromSql for Cid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_i64()?;
        Cid::from_i64(raw).ok_or(FromSqlError::OutOfRange(raw))
    }
}

/// Object within a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Soid {
    pub sidx: SIndex,
    pub oid: Oid,
}

impl Soid {
    pub fn new(sidx: SIndex, oid: Oid) -> Self {
        Self { sidx, oid }
    }

    pub fn with_cid(self, cid: Cid) -> Socid {
        Socid::new(self.sidx, self.oid, cid)
    }
}

impl fmt::Display for Soid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sidx, self.oid)
    }
}

/// Store, object and component: the key of all version tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Socid {
    pub sidx: SIndex,
    pub oid: Oid,
    pub cid: Cid,
}

impl Socid {
    pub fn new(sidx: SIndex, oid: Oid, cid: Cid) -> Self {
        Self { sidx, oid, cid }
    }

    pub fn soid(&self) -> Soid {
        Soid::new(self.sidx, self.oid)
    }
}

impl fmt::Display for Socid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.sidx, self.oid, self.cid)
    }
}

/// Per-device logical clock value
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    pub fn next(self) -> Tick {
        Tick(self.0 + 1)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for Tick {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let raw = i64::try_from(self.0)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(raw))
    }
}

impl FromSql for Tick {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_i64()?;
        u64::try_from(raw)
            .map(Tick)
            .map_err(|_| FromSqlError::OutOfRange(raw))
    }
}
