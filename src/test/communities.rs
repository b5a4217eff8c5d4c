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

use pretty_assertions::assert_eq;

use crate::communities::{
    blackhole_communities, format_for_vendor, validate_as_set, validate_asn, Asn, Community,
    CommunityKind,
};
use crate::registry::effective_prefix_limit;

#[test]
fn asn_validation() {
    assert!(validate_asn("AS1"));
    assert!(validate_asn("AS64512"));
    assert!(validate_asn("AS4294967294"));
    assert!(validate_asn("as64512"));
    assert!(validate_asn("aS64512"));

    assert!(!validate_asn("AS0"));
    assert!(!validate_asn("AS23456"));
    assert!(!validate_asn("AS4294967295"));
    assert!(!validate_asn("AS4294967296"));
    assert!(!validate_asn("64512"));
    assert!(!validate_asn("ASfoo"));
    assert!(!validate_asn("AS-1"));
    assert!(!validate_asn("AS+1"));
    assert!(!validate_asn("AS 1"));
    assert!(!validate_asn(""));
}

#[test]
fn asn_roundtrip() {
    let asn: Asn = "AS64512".parse().unwrap();
    assert_eq!(asn.value(), 64512);
    assert_eq!(asn.to_string(), "AS64512");
    assert!(!asn.is_32bit());
    let wide: Asn = "AS4200000001".parse().unwrap();
    assert!(wide.is_32bit());
}

#[test]
fn as_set_validation() {
    assert!(validate_as_set("AS-EXAMPLE"));
    assert!(validate_as_set("as-example"));
    assert!(validate_as_set("AS64500:AS-CUSTOMERS"));
    assert!(validate_as_set("AS-EXA-MPLE2"));

    assert!(!validate_as_set("EXAMPLE"));
    assert!(!validate_as_set("AS64500"));
    assert!(!validate_as_set("AS-"));
    assert!(!validate_as_set("AS64500:EXAMPLE"));
}

#[test]
fn community_classification() {
    assert_eq!(Community::classify("64512:100"), (true, CommunityKind::Standard));
    assert_eq!(Community::classify("0:0"), (true, CommunityKind::Standard));
    assert_eq!(Community::classify("65535:65535"), (true, CommunityKind::Standard));
    assert_eq!(Community::classify("70000:100"), (false, CommunityKind::Standard));
    assert_eq!(Community::classify("64512:1:100"), (true, CommunityKind::Large));
    assert_eq!(
        Community::classify("4200000001:1:200"),
        (true, CommunityKind::Large)
    );
    // a three-part community is a large community or nothing at all
    assert_eq!(
        Community::classify("4294967296:0:0"),
        (false, CommunityKind::Large)
    );
    assert_eq!(Community::classify("no_export"), (true, CommunityKind::Standard));
    assert_eq!(Community::classify("1:2:3:4"), (false, CommunityKind::Standard));
    assert_eq!(Community::classify("banana"), (false, CommunityKind::Standard));
}

#[test]
fn community_display_roundtrip() {
    for literal in ["64512:100", "0:65535", "4200000001:1:200", "0:0:0"] {
        let community: Community = literal.parse().unwrap();
        assert_eq!(community.to_string(), literal);
    }
}

#[test]
fn well_known_communities() {
    assert_eq!(
        "NO_EXPORT".parse::<Community>().unwrap(),
        Community::Standard(65535, 65281)
    );
    assert_eq!(
        "no_advertise".parse::<Community>().unwrap(),
        Community::Standard(65535, 65282)
    );
    assert_eq!(
        "No_Export_Subconfed".parse::<Community>().unwrap(),
        Community::Standard(65535, 65283)
    );
    assert_eq!(
        "blackhole".parse::<Community>().unwrap(),
        Community::Standard(65535, 666)
    );
}

#[test]
fn vendor_formatting() {
    let communities = vec![
        Community::Standard(64512, 100),
        Community::Large(4200000001, 1, 200),
    ];
    assert_eq!(
        format_for_vendor("bird", &communities),
        vec!["(64512, 100)", "(4200000001, 1, 200)"]
    );
    assert_eq!(
        format_for_vendor("Cisco", &communities),
        vec!["64512:100", "large:4200000001:1:200"]
    );
    assert_eq!(
        format_for_vendor("frr", &communities),
        vec!["64512:100", "large:4200000001:1:200"]
    );
    assert_eq!(
        format_for_vendor("somethingelse", &communities),
        vec!["64512:100", "4200000001:1:200"]
    );
}

#[test]
fn blackhole_16bit_asn() {
    let asn = Asn::new(64512).unwrap();
    assert_eq!(
        blackhole_communities(asn, true, true),
        vec!["65535:666", "64512:666"]
    );
}

#[test]
fn blackhole_32bit_asn() {
    let asn = Asn::new(4200000001).unwrap();
    assert_eq!(
        blackhole_communities(asn, true, false),
        vec!["65535:666", "4200000001:666:0"]
    );
    assert_eq!(
        blackhole_communities(asn, true, true),
        vec!["65535:666", "4200000001:666:0", "64086:59905"]
    );
    assert_eq!(blackhole_communities(asn, false, false), vec!["65535:666"]);
}

#[test]
fn prefix_limit_scaling() {
    assert_eq!(effective_prefix_limit(None), 100);
    assert_eq!(effective_prefix_limit(Some(0)), 100);
    assert_eq!(effective_prefix_limit(Some(50)), 100);
    assert_eq!(effective_prefix_limit(Some(100)), 110);
    assert_eq!(effective_prefix_limit(Some(1000)), 1100);
}
