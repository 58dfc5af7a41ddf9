//! # Correlation Identifiers
//!
//! Every id is 128 random bits. Ids are rendered, parsed and serialized as 32
//! lowercase hex characters, so they survive any JSON implementation on the
//! other end without precision loss.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::error::Error;

macro_rules! random_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(u128);

        impl $name {
            /// A fresh id from the thread-local CSPRNG.
            pub fn random() -> Self {
                Self(rand::random())
            }

            pub const fn from_u128(raw: u128) -> Self {
                Self(raw)
            }

            pub const fn as_u128(self) -> u128 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:032x}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Error> {
                if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(Error::InvalidId(s.to_string()));
                }
                u128::from_str_radix(s, 16)
                    .map(Self)
                    .map_err(|_| Error::InvalidId(s.to_string()))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

random_id! {
    /// Joins every message that belongs to one invocation. Chosen by the
    /// client.
    InvocationId
}

random_id! {
    /// Correlates an interim request with the client's response.
    RequestId
}

random_id! {
    /// Identity of one node in a progress tree.
    TaskId
}
