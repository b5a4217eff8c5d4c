// AutoPeer: BGP peering automation toolchain written in Rust
// Copyright (C) 2022-2023 AutoPeer contributors <noc@autopeer.example.net>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Validation and parsing of AS numbers, AS-SET names and BGP communities
//! (both classic RFC 1997 communities and RFC 8092 large communities),
//! together with the vendor-specific formatting used by the renderers.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// AS_TRANS (RFC 6793). Reserved, never a valid peer ASN.
pub const AS_TRANS: u32 = 23456;

/// A validated autonomous system number.
///
/// The textual form is `AS<n>`, case-insensitive. The numeric value must lie
/// in `1..=4294967294`, excluding [`AS_TRANS`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Asn(u32);

impl Asn {
    /// Create an ASN from its numeric value, rejecting reserved values.
    pub fn new(value: u32) -> Result<Self, InvalidAsn> {
        if value == 0 || value == AS_TRANS || value == u32::MAX {
            Err(InvalidAsn(format!("AS{value}")))
        } else {
            Ok(Self(value))
        }
    }

    /// The numeric value of the ASN.
    pub fn value(self) -> u32 {
        self.0
    }

    /// Whether this ASN does not fit into the 16-bit ASN space.
    pub fn is_32bit(self) -> bool {
        self.0 > 0xffff
    }
}

impl fmt::Display for Asn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AS{}", self.0)
    }
}

impl fmt::Debug for Asn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AS{}", self.0)
    }
}

impl FromStr for Asn {
    type Err = InvalidAsn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidAsn(s.to_string());
        if s.len() < 3 || !s[..2].eq_ignore_ascii_case("as") {
            return Err(err());
        }
        let value = parse_dec::<u32>(&s[2..]).ok_or_else(err)?;
        Asn::new(value).map_err(|_| err())
    }
}

impl TryFrom<String> for Asn {
    type Error = InvalidAsn;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Asn> for String {
    fn from(asn: Asn) -> Self {
        asn.to_string()
    }
}

/// The given string is not a valid AS number.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid AS number: {0}")]
pub struct InvalidAsn(pub String);

/// Check whether a string is a valid `AS<n>` token.
pub fn validate_asn(s: &str) -> bool {
    s.parse::<Asn>().is_ok()
}

/// Check whether a string is a valid AS-SET name (`AS-NAME` or
/// `AS<n>:AS-NAME`).
pub fn validate_as_set(s: &str) -> bool {
    lazy_static! {
        static ref AS_SET_RE: Regex = Regex::new(r"(?i)^(AS\d+:)?AS-[A-Z0-9\-]+$").unwrap();
    }
    AS_SET_RE.is_match(s)
}

/// Strict decimal parser. Unlike `str::parse`, this rejects signs and
/// whitespace, so only `\d+` is accepted.
fn parse_dec<T: FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// The two community grammars understood by the toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunityKind {
    /// RFC 1997 `uint16:uint16` community.
    Standard,
    /// RFC 8092 `uint32:uint32:uint32` large community.
    Large,
}

/// A parsed BGP community.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Community {
    /// Classic community `a:b`, both parts 16 bit.
    Standard(u16, u16),
    /// Large community `a:b:c`, all parts 32 bit.
    Large(u32, u32, u32),
}

impl Community {
    /// The grammar this community was parsed with.
    pub fn kind(&self) -> CommunityKind {
        match self {
            Community::Standard(_, _) => CommunityKind::Standard,
            Community::Large(_, _, _) => CommunityKind::Large,
        }
    }

    /// Resolve a well-known community name (RFC 1997 names plus `BLACKHOLE`
    /// from RFC 7999) to its fixed numeric form. Matching is
    /// case-insensitive.
    pub fn well_known(name: &str) -> Option<Community> {
        match name.to_ascii_uppercase().as_str() {
            "NO_EXPORT" => Some(Community::Standard(65535, 65281)),
            "NO_ADVERTISE" => Some(Community::Standard(65535, 65282)),
            "NO_EXPORT_SUBCONFED" => Some(Community::Standard(65535, 65283)),
            "BLACKHOLE" => Some(Community::Standard(65535, 666)),
            _ => None,
        }
    }

    /// Classify a community string without fully committing to a parse.
    ///
    /// The colon count alone selects which grammar is attempted; a string
    /// that looks like a large community but overflows 32 bits is an invalid
    /// *large* community, never silently re-interpreted as anything else.
    pub fn classify(s: &str) -> (bool, CommunityKind) {
        if Community::well_known(s).is_some() {
            return (true, CommunityKind::Standard);
        }
        match s.bytes().filter(|b| *b == b':').count() {
            1 => (s.parse::<Community>().is_ok(), CommunityKind::Standard),
            2 => (s.parse::<Community>().is_ok(), CommunityKind::Large),
            _ => (false, CommunityKind::Standard),
        }
    }
}

impl FromStr for Community {
    type Err = InvalidCommunity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(c) = Community::well_known(s) {
            return Ok(c);
        }
        let err = || InvalidCommunity(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [a, b] => Ok(Community::Standard(
                parse_dec(a).ok_or_else(err)?,
                parse_dec(b).ok_or_else(err)?,
            )),
            [a, b, c] => Ok(Community::Large(
                parse_dec(a).ok_or_else(err)?,
                parse_dec(b).ok_or_else(err)?,
                parse_dec(c).ok_or_else(err)?,
            )),
            _ => Err(err()),
        }
    }
}

impl fmt::Display for Community {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Community::Standard(a, b) => write!(f, "{a}:{b}"),
            Community::Large(a, b, c) => write!(f, "{a}:{b}:{c}"),
        }
    }
}

/// The given string is neither a valid standard nor large community.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid BGP community: {0}")]
pub struct InvalidCommunity(pub String);

/// Format a list of communities in the syntax a vendor expects.
///
/// BIRD uses tuple notation, Cisco and FRR use colon notation with a
/// `large:` prefix for large communities. Unknown vendors get the canonical
/// textual form unchanged.
pub fn format_for_vendor(vendor: &str, communities: &[Community]) -> Vec<String> {
    let vendor = vendor.to_ascii_lowercase();
    communities
        .iter()
        .map(|c| match (vendor.as_str(), c) {
            ("bird" | "bird1" | "bird2", Community::Standard(a, b)) => format!("({a}, {b})"),
            ("bird" | "bird1" | "bird2", Community::Large(a, b, c)) => format!("({a}, {b}, {c})"),
            ("cisco" | "frr", Community::Standard(_, _)) => c.to_string(),
            ("cisco" | "frr", Community::Large(a, b, c)) => format!("large:{a}:{b}:{c}"),
            _ => c.to_string(),
        })
        .collect()
}

/// Build the blackhole community set for a peer ASN.
///
/// Always contains the RFC 7999 well-known `65535:666`. For 16-bit ASNs an
/// `ASN:666` variant is added. For 32-bit ASNs, `use_large` adds the large
/// community `ASN:666:0`, and `legacy_split` additionally emits the
/// operator-specific `hi16:lo16` encoding of the ASN.
pub fn blackhole_communities(asn: Asn, use_large: bool, legacy_split: bool) -> Vec<String> {
    let mut communities = vec!["65535:666".to_string()];
    let n = asn.value();
    if !asn.is_32bit() {
        communities.push(format!("{n}:666"));
    } else {
        if use_large {
            communities.push(format!("{n}:666:0"));
        }
        if legacy_split {
            communities.push(format!("{}:{}", n >> 16, n & 0xffff));
        }
    }
    communities
}
