//! Logical participant addresses and the broadcast rooms derived from them.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Reserved target meaning "the sender's own broadcast room".
pub const BROADCAST_TARGET: &str = "broadcast";

const ROOM_SUFFIX: &str = "-broadcast";

/// A registered participant address, e.g. `service.worker.3`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusPath(String);

impl BusPath {
    /// Validate and wrap a path.
    ///
    /// Empty paths and the reserved `broadcast` target are rejected.
    pub fn parse(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err("path must not be empty".into());
        }
        if raw == BROADCAST_TARGET {
            return Err(format!("'{BROADCAST_TARGET}' is reserved and cannot be registered"));
        }
        Ok(Self(raw))
    }

    /// The path text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The room that receives this path's publishes.
    pub fn broadcast_room(&self) -> RoomName {
        RoomName(format!("{}{ROOM_SUFFIX}", self.0))
    }
}

impl fmt::Display for BusPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BusPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for BusPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Name of a broadcast room (`<path>-broadcast`).
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
    /// The room name text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
