//! Byte-order selection for the 16-bit wire encoding.
//!
//! The peer executables store one character per 16-bit word in their own
//! CPU's byte order. The order is a configuration choice, never autodetected
//! from traffic, because a mismatched peer produces frames that decode to
//! garbage without any reliable in-band signal.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Byte order of the peer's 16-bit character words.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ByteOrder {
    /// Most significant byte first.
    Big,
    /// Least significant byte first.
    Little,
}

impl ByteOrder {
    /// The byte order of the machine this front-end runs on.
    ///
    /// Peers are almost always built for the same host, so this is the
    /// default configuration value.
    #[must_use]
    pub const fn host() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        Self::host()
    }
}
