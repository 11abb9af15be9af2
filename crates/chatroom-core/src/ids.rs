//! Prefixed string ids for correlation, requests, echoes and connections.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr, $generate:path) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// A fresh id.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, $generate()))
            }

            /// Wrap an id received from a peer as is.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// The id text.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Unwrap into the id text.
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Correlation-style ids are fully random so they never collide across
// participants; connection ids are time-ordered for readable logs.
branded_id!(
    /// `_uid` of an envelope; the broker acks under it.
    CorrelationId, "uid", Uuid::new_v4
);
branded_id!(
    /// Id of an RPC call, echoed back in its reply.
    RequestId, "req", Uuid::new_v4
);
branded_id!(
    /// Id of an echo round trip.
    EchoId, "echo", Uuid::new_v4
);
branded_id!(
    /// Broker-side handle for one open link.
    ConnectionId, "conn", Uuid::now_v7
);
