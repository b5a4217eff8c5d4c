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

use std::path::PathBuf;
use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::filters::{
    artifact_fresh, filter_filename, has_prefix_sets, stanza_name, FilterGenerator, FilterRequest,
    Strictness, FILTER_CACHE_TTL,
};
use crate::test::asn;
use crate::AddressFamily;

fn generator_without_tool(workdir: PathBuf) -> FilterGenerator {
    let mut generator = FilterGenerator::new(workdir, "rr.ntt.net");
    // a tool path that cannot exist, so any invocation attempt fails loudly
    generator.bgpq3_bin = PathBuf::from("/nonexistent/bgpq3");
    generator
}

fn request(asn_str: &str, tokens: &[&str], blackhole: bool) -> FilterRequest {
    FilterRequest {
        asn: asn(asn_str),
        tokens: tokens.iter().map(ToString::to_string).collect(),
        irr_order: "NTTCOM,RADB".to_string(),
        blackhole_accept: blackhole,
    }
}

#[test]
fn artifact_naming() {
    let a = asn("AS64500");
    assert_eq!(
        filter_filename(a, AddressFamily::Ipv4, Strictness::Strict),
        "AS64500.prefixset.bird.ipv4"
    );
    assert_eq!(
        filter_filename(a, AddressFamily::Ipv6, Strictness::Strict),
        "AS64500.prefixset.bird.ipv6"
    );
    assert_eq!(
        filter_filename(a, AddressFamily::Ipv4, Strictness::Loose),
        "AS64500.looseprefixset.bird.ipv4"
    );
    assert_eq!(
        stanza_name(a, AddressFamily::Ipv4, Strictness::Strict),
        "AUTOFILTER_AS64500_IPv4"
    );
    assert_eq!(
        stanza_name(a, AddressFamily::Ipv6, Strictness::Loose),
        "LOOSEFILTER_AS64500_IPv6"
    );
}

#[test]
fn max_prefix_length_ceilings() {
    assert_eq!(Strictness::Strict.max_prefix_length(AddressFamily::Ipv4), "24");
    assert_eq!(Strictness::Strict.max_prefix_length(AddressFamily::Ipv6), "48");
    assert_eq!(Strictness::Loose.max_prefix_length(AddressFamily::Ipv4), "32");
    assert_eq!(Strictness::Loose.max_prefix_length(AddressFamily::Ipv6), "128");
}

#[test]
fn freshness_check() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("AS64500.prefixset.bird.ipv4");
    assert!(!artifact_fresh(&path, FILTER_CACHE_TTL));
    std::fs::write(&path, "# empty prefix set\n").unwrap();
    assert!(artifact_fresh(&path, FILTER_CACHE_TTL));
    // a zero TTL means everything is stale
    assert!(!artifact_fresh(&path, Duration::from_secs(0)));
}

#[test]
fn prefix_set_presence() {
    let dir = tempfile::tempdir().unwrap();
    assert!(!has_prefix_sets(dir.path(), asn("AS64500")));
    std::fs::write(dir.path().join("AS64500.prefixset.bird.ipv6"), "x\n").unwrap();
    assert!(has_prefix_sets(dir.path(), asn("AS64500")));
}

#[tokio::test]
async fn fresh_artifacts_are_pure_cache_hits() {
    let dir = tempfile::tempdir().unwrap();
    for family in ["ipv4", "ipv6"] {
        std::fs::write(
            dir.path().join(format!("AS64500.prefixset.bird.{family}")),
            "# cached\n",
        )
        .unwrap();
    }
    let generator = generator_without_tool(dir.path().to_path_buf());

    // with the tool unavailable, this can only succeed via the cache
    let messages = generator
        .generate_for_request(&request("AS64500", &["AS-EXAMPLE"], false))
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.contains("cached")));
}

#[tokio::test]
async fn any_import_skips_generation() {
    let dir = tempfile::tempdir().unwrap();
    let generator = generator_without_tool(dir.path().to_path_buf());
    let messages = generator
        .generate_for_request(&request("AS64512", &["ANY"], true))
        .await
        .unwrap();
    assert!(messages.is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn failing_asn_does_not_poison_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let generator = generator_without_tool(dir.path().to_path_buf());

    let outcomes = generator
        .generate_all(vec![
            request("AS64512", &["ANY"], false),
            request("AS64500", &["AS-EXAMPLE"], false),
        ])
        .await;

    assert_eq!(outcomes.len(), 2);
    let failed = outcomes.iter().find(|o| o.asn == asn("AS64500")).unwrap();
    assert!(!failed.is_success());
    let skipped = outcomes.iter().find(|o| o.asn == asn("AS64512")).unwrap();
    assert!(skipped.is_success());
}

#[tokio::test]
async fn loose_filters_only_for_blackhole_peers() {
    let dir = tempfile::tempdir().unwrap();
    // strict and loose artifacts are all fresh, so no tool runs
    for prefix in ["prefixset", "looseprefixset"] {
        for family in ["ipv4", "ipv6"] {
            std::fs::write(
                dir.path().join(format!("AS64510.{prefix}.bird.{family}")),
                "# cached\n",
            )
            .unwrap();
        }
    }
    let generator = generator_without_tool(dir.path().to_path_buf());

    let with_blackhole = generator
        .generate_for_request(&request("AS64510", &["AS64510"], true))
        .await
        .unwrap();
    assert_eq!(with_blackhole.len(), 4);

    let without_blackhole = generator
        .generate_for_request(&request("AS64510", &["AS64510"], false))
        .await
        .unwrap();
    assert_eq!(without_blackhole.len(), 2);
}
