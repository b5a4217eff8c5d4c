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

mod communities;
mod filters;
mod policy;
mod state;
mod vendor;

use crate::config::{GlobalConfig, Manifest, PeerType};
use crate::policy::ResolvedSessionPolicy;
use crate::{AddressFamily, Asn};

/// Two routers, two IXPs, one peer with layered overrides.
pub(crate) const GLOBAL_CONFIG: &str = r#"
bgp:
  dc1-1:
    fqdn: dc1-1.router.example.net
    ipv4: 192.0.2.1
    ipv6: 2001:db8::1
    vendor: bird
  dc1-2:
    fqdn: dc1-2.router.example.net
    ipv4: 192.0.2.2
    ipv6: 2001:db8::2
    vendor: bird
    graceful_shutdown: true
ixp_map:
  AMS-IX:
    ipv4_range: 80.249.208.0/21
    ipv6_range: 2001:7f8:1::/64
    present_on:
      - dc1-1.router.example.net
      - dc1-2.router.example.net
  FRA-IX:
    ipv4_range: 80.81.192.0/21
    ipv6_range: 2001:7f8:2::/64
    bgp_local_pref: 250
    ixp_community: "65500:120"
    present_on:
      - dc1-2.router.example.net
bgp_groups:
  AMS-IX:
    graceful_shutdown: true
  AMS-IX-dc1-1:
    admin_down_state: true
bgp_settings:
  AS64500:
    common:
      bgp_local_pref: 120
    ixp:
      AMS-IX:
        bgp_local_pref: 130
    session:
      80.249.208.1:
        bgp_local_pref: 140
bgp_passwords:
  AS64500: sekrit
rpki: true
peerings_url: https://example.net/peerings.yml
builddir: /tmp/autopeer-test-build
stagedir: /tmp/autopeer-test-stage
"#;

pub(crate) const MANIFEST: &str = r#"
AS64500:
  import: "AS-EXAMPLE"
  export: "ANY"
  description: Example peer
AS64512:
  import: "ANY"
  export: "ANY"
  description: Unfiltered peer
AS64510:
  import: "AS64510"
  export: "AS-OURCONE"
  description: Strict downstream
  type: downstream
  ipv4_limit: 50
  blackhole_accept: true
"#;

pub(crate) fn test_config() -> GlobalConfig {
    GlobalConfig::parse(GLOBAL_CONFIG).expect("fixture config parses")
}

pub(crate) fn test_manifest() -> Manifest {
    Manifest::parse(MANIFEST).expect("fixture manifest parses")
}

pub(crate) fn asn(s: &str) -> Asn {
    s.parse().expect("valid ASN literal")
}

/// A fully populated resolved session for renderer tests.
pub(crate) fn session_policy() -> ResolvedSessionPolicy {
    ResolvedSessionPolicy {
        asn: asn("AS64500"),
        session_ip: "80.249.208.1".parse().unwrap(),
        family: AddressFamily::Ipv4,
        router: "dc1-1.router.example.net".to_string(),
        router_short: "dc1-1".to_string(),
        ixp: "AMS-IX".to_string(),
        description: "Example peer".to_string(),
        peer_type: PeerType::Peer,
        no_filter: false,
        export_full_table: true,
        filter_name: "peer_in_AS64500_ipv4".to_string(),
        prefix_set: "AUTOFILTER_AS64500_IPv4".to_string(),
        loose_prefix_set: "LOOSEFILTER_AS64500_IPv4".to_string(),
        limit: 1100,
        gtsm: false,
        multihop: false,
        disable_multihop_source_map: false,
        password: None,
        source_address: "192.0.2.1".parse().unwrap(),
        ixp_community: None,
        local_pref: 100,
        admin_down_state: false,
        graceful_shutdown: false,
        block_importexport: false,
        blackhole_accept: false,
        blackhole_community: vec!["65535:666".to_string()],
        rpki: false,
        neighbor_name: "peer_AS64500_AMSIX_1A2B3C".to_string(),
    }
}
