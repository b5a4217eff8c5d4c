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

use std::collections::BTreeMap;
use std::net::IpAddr;

use maplit::btreemap;
use pretty_assertions::assert_eq;

use crate::communities::Asn;
use crate::config::{GlobalConfig, Manifest, PeerType};
use crate::policy::{local_pref_default, session_digest, PolicyResolver, ResolvedSessionPolicy};
use crate::registry::PrefixLimits;
use crate::test::{asn, test_config, test_manifest};
use crate::AddressFamily;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn no_limits() -> BTreeMap<Asn, PrefixLimits> {
    BTreeMap::new()
}

fn resolve(
    config: &GlobalConfig,
    manifest: &Manifest,
    sessions: &BTreeMap<u32, Vec<IpAddr>>,
    limits: &BTreeMap<Asn, PrefixLimits>,
) -> Vec<ResolvedSessionPolicy> {
    PolicyResolver::new(config, manifest, sessions, limits)
        .resolve_all()
        .policies
}

#[test]
fn unfiltered_peer_on_single_router_ixp() {
    let config = GlobalConfig::parse(
        r#"
bgp:
  dc1-1:
    fqdn: dc1-1.router.example.net
    ipv4: 192.0.2.1
    ipv6: 2001:db8::1
    vendor: bird2
ixp_map:
  AMS-IX:
    ipv4_range: 80.249.208.0/21
    ipv6_range: 2001:7f8:1::/64
    present_on:
      - dc1-1.router.example.net
"#,
    )
    .unwrap();
    let manifest =
        Manifest::parse("AS64512:\n  import: ANY\n  export: ANY\n  description: Unfiltered\n")
            .unwrap();
    let sessions = btreemap! { 64512 => vec![ip("80.249.208.1")] };

    let policies = resolve(&config, &manifest, &sessions, &no_limits());
    assert_eq!(policies.len(), 1);
    let policy = &policies[0];
    assert_eq!(policy.asn, asn("AS64512"));
    assert_eq!(policy.router, "dc1-1.router.example.net");
    assert_eq!(policy.ixp, "AMS-IX");
    assert_eq!(policy.family, AddressFamily::Ipv4);
    assert!(policy.no_filter);
    assert!(policy.export_full_table);
    assert_eq!(policy.filter_name, "ebgp_unfiltered_peering_import");
    assert_eq!(policy.local_pref, 100);
    assert_eq!(policy.limit, 10_000);
    assert!(!policy.admin_down_state);
}

#[test]
fn session_deployed_on_every_ixp_router() {
    let config = test_config();
    let manifest = test_manifest();
    let sessions = btreemap! { 64512 => vec![ip("80.249.208.9")] };

    let policies = resolve(&config, &manifest, &sessions, &no_limits());
    let routers: Vec<&str> = policies.iter().map(|p| p.router.as_str()).collect();
    assert_eq!(
        routers,
        vec!["dc1-1.router.example.net", "dc1-2.router.example.net"]
    );
    assert!(policies.iter().all(|p| p.ixp == "AMS-IX"));
}

#[test]
fn local_pref_precedence_session_over_ixp() {
    let config = test_config();
    let manifest = test_manifest();
    // the fixture has session 80.249.208.1 -> 140, AMS-IX -> 130, common -> 120
    let sessions = btreemap! {
        64500 => vec![ip("80.249.208.1"), ip("80.249.208.2")]
    };

    let policies = resolve(&config, &manifest, &sessions, &no_limits());
    let by_ip = |target: IpAddr| {
        policies
            .iter()
            .find(|p| p.session_ip == target)
            .expect("session resolved")
    };
    assert_eq!(by_ip(ip("80.249.208.1")).local_pref, 140);
    assert_eq!(by_ip(ip("80.249.208.2")).local_pref, 130);
}

#[test]
fn local_pref_common_beats_ixp_default() {
    let config = test_config();
    let manifest = test_manifest();
    // FRA-IX declares a default of 250, but the peer-common scope wins
    let sessions = btreemap! { 64500 => vec![ip("80.81.192.1")] };
    let policies = resolve(&config, &manifest, &sessions, &no_limits());
    assert_eq!(policies[0].local_pref, 120);
}

#[test]
fn local_pref_ixp_default_and_type_fallback() {
    let config = test_config();
    let manifest = Manifest::parse(
        "AS64999:\n  import: ANY\n  export: ANY\nAS64998:\n  import: ANY\n  export: ANY\n  type: downstream\nAS64997:\n  import: ANY\n  export: ANY\n  type: upstream\n",
    )
    .unwrap();
    let sessions = btreemap! {
        64999 => vec![ip("80.81.192.10")],
        64998 => vec![ip("80.249.208.10")],
        64997 => vec![ip("80.249.208.11")],
    };

    let policies = resolve(&config, &manifest, &sessions, &no_limits());
    let for_asn = |a: &str| {
        policies
            .iter()
            .find(|p| p.asn == asn(a))
            .expect("peer resolved")
    };
    // FRA-IX default applies when no peer scope matches
    assert_eq!(for_asn("AS64999").local_pref, 250);
    // AMS-IX has no default, so the type fallback decides
    assert_eq!(for_asn("AS64998").local_pref, 500);
    assert_eq!(for_asn("AS64997").local_pref, 60);
}

#[test]
fn type_fallback_values() {
    assert_eq!(local_pref_default(PeerType::Downstream), 500);
    assert_eq!(local_pref_default(PeerType::Upstream), 60);
    assert_eq!(local_pref_default(PeerType::Peer), 100);
}

#[test]
fn only_with_overrides_registry_sessions() {
    let config = test_config();
    let manifest = Manifest::parse(
        "AS64600:\n  import: ANY\n  export: ANY\n  only_with:\n    - 80.249.208.77\n",
    )
    .unwrap();
    // the registry knows a different address, which must be ignored
    let sessions = btreemap! { 64600 => vec![ip("80.249.208.1")] };

    let policies = resolve(&config, &manifest, &sessions, &no_limits());
    assert!(policies.iter().all(|p| p.session_ip == ip("80.249.208.77")));
}

#[test]
fn not_with_removes_registry_session() {
    let config = test_config();
    let manifest = Manifest::parse(
        "AS64600:\n  import: ANY\n  export: ANY\n  not_with:\n    - 80.249.208.2\n    - not-an-ip\n",
    )
    .unwrap();
    let sessions = btreemap! {
        64600 => vec![ip("80.249.208.1"), ip("80.249.208.2")]
    };

    let policies = resolve(&config, &manifest, &sessions, &no_limits());
    assert!(!policies.is_empty());
    assert!(policies.iter().all(|p| p.session_ip == ip("80.249.208.1")));
}

#[test]
fn peer_without_sessions_is_skipped() {
    let config = test_config();
    let manifest = test_manifest();
    let sessions = BTreeMap::new();

    let resolver = PolicyResolver::new(&config, &manifest, &sessions, &no_limits());
    let outcome = resolver.resolve_all();
    assert!(outcome.policies.is_empty());
    assert_eq!(outcome.peers_without_sessions, 3);
}

#[test]
fn only_on_and_not_on_restrictions() {
    let config = test_config();
    let manifest = Manifest::parse(
        r#"
AS64600:
  import: ANY
  export: ANY
  only_on:
    - dc1-2.router.example.net
AS64601:
  import: ANY
  export: ANY
  not_on:
    - AMS-IX
"#,
    )
    .unwrap();
    let sessions = btreemap! {
        64600 => vec![ip("80.249.208.5")],
        64601 => vec![ip("80.249.208.6"), ip("80.81.192.6")],
    };

    let policies = resolve(&config, &manifest, &sessions, &no_limits());
    let of = |a: &str| {
        policies
            .iter()
            .filter(|p| p.asn == asn(a))
            .collect::<Vec<_>>()
    };
    // only_on keeps only the named router of the IXP
    let restricted = of("AS64600");
    assert_eq!(restricted.len(), 1);
    assert_eq!(restricted[0].router, "dc1-2.router.example.net");
    // not_on drops the AMS-IX session but keeps the FRA-IX one
    let excluded = of("AS64601");
    assert_eq!(excluded.len(), 1);
    assert_eq!(excluded[0].ixp, "FRA-IX");
}

#[test]
fn prefix_limit_precedence() {
    let config = test_config();
    let manifest = test_manifest();
    let sessions = btreemap! {
        64500 => vec![ip("80.249.208.1")],
        64510 => vec![ip("80.249.208.2")],
        64512 => vec![ip("2001:7f8:1::12")],
    };
    let limits = btreemap! {
        asn("AS64500") => PrefixLimits { v4: 1100, v6: 110 },
        asn("AS64510") => PrefixLimits { v4: 2200, v6: 220 },
    };

    let policies = resolve(&config, &manifest, &sessions, &limits);
    let for_asn = |a: &str| policies.iter().find(|p| p.asn == asn(a)).unwrap();
    // registry-derived limit
    assert_eq!(for_asn("AS64500").limit, 1100);
    // explicit manifest override beats the registry
    assert_eq!(for_asn("AS64510").limit, 50);
    // no data at all falls back to the v6 default
    assert_eq!(for_asn("AS64512").limit, 1_000);
    assert_eq!(for_asn("AS64512").family, AddressFamily::Ipv6);
}

#[test]
fn admin_down_and_graceful_shutdown_precedence() {
    let config = test_config();
    let manifest = test_manifest();
    let sessions = btreemap! {
        64500 => vec![ip("80.249.208.1"), ip("80.81.192.1")]
    };

    let policies = resolve(&config, &manifest, &sessions, &no_limits());
    let find = |router: &str, ixp: &str| {
        policies
            .iter()
            .find(|p| p.router_short == router && p.ixp == ixp)
            .expect("policy resolved")
    };

    // (IXP, router) pair setting hits only dc1-1 on AMS-IX
    assert!(find("dc1-1", "AMS-IX").admin_down_state);
    assert!(!find("dc1-2", "AMS-IX").admin_down_state);
    // IXP-wide graceful shutdown hits both AMS-IX routers
    assert!(find("dc1-1", "AMS-IX").graceful_shutdown);
    assert!(find("dc1-2", "AMS-IX").graceful_shutdown);
    // on FRA-IX no group matches, so the router-level flag decides
    assert!(find("dc1-2", "FRA-IX").graceful_shutdown);
}

#[test]
fn names_and_session_attributes() {
    let config = test_config();
    let manifest = test_manifest();
    let sessions = btreemap! { 64500 => vec![ip("80.249.208.1"), ip("80.81.192.1")] };

    let policies = resolve(&config, &manifest, &sessions, &no_limits());
    let ams = policies.iter().find(|p| p.ixp == "AMS-IX").unwrap();
    assert_eq!(ams.prefix_set, "AUTOFILTER_AS64500_IPv4");
    assert_eq!(ams.loose_prefix_set, "LOOSEFILTER_AS64500_IPv4");
    assert_eq!(ams.filter_name, "peer_in_AS64500_ipv4");
    assert!(ams.neighbor_name.starts_with("peer_AS64500_AMSIX_"));
    assert_eq!(ams.password.as_deref(), Some("sekrit"));
    assert_eq!(ams.source_address, ip("192.0.2.1"));
    assert!(ams.rpki);
    assert_eq!(ams.ixp_community, None);

    let fra = policies.iter().find(|p| p.ixp == "FRA-IX").unwrap();
    assert_eq!(fra.ixp_community.as_deref(), Some("65500:120"));
}

#[test]
fn invalid_import_tokens_are_counted() {
    let config = test_config();
    let manifest =
        Manifest::parse("AS64600:\n  import: \"AS-GOOD bogus AS64601\"\n  export: ANY\n").unwrap();
    let sessions = btreemap! { 64600 => vec![ip("80.249.208.3")] };

    let resolver = PolicyResolver::new(&config, &manifest, &sessions, &no_limits());
    let outcome = resolver.resolve_all();
    assert_eq!(outcome.invalid_import_tokens, 1);
    // the peer itself is still resolved
    assert!(!outcome.policies.is_empty());
}

#[test]
fn blackhole_communities_default_for_accepting_peers() {
    let config = test_config();
    let manifest = test_manifest();
    let sessions = btreemap! {
        64510 => vec![ip("80.249.208.2")],
        64500 => vec![ip("80.249.208.1")],
    };

    let policies = resolve(&config, &manifest, &sessions, &no_limits());
    let accepting = policies.iter().find(|p| p.asn == asn("AS64510")).unwrap();
    assert!(accepting.blackhole_accept);
    assert_eq!(accepting.blackhole_community, vec!["65535:666", "64510:666"]);
    // peers without blackhole_accept only carry the well-known community
    let plain = policies.iter().find(|p| p.asn == asn("AS64500")).unwrap();
    assert_eq!(plain.blackhole_community, vec!["65535:666"]);
}

#[test]
fn session_digest_is_stable() {
    let a = session_digest(ip("80.249.208.1"));
    let b = session_digest(ip("80.249.208.1"));
    let c = session_digest(ip("80.249.208.2"));
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 6);
    assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
}
