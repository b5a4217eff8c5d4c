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

//! The policy resolver. For every declared peer it determines the candidate
//! session addresses, matches them against the IXP peering LANs, applies the
//! layered setting precedence, and emits one [`ResolvedSessionPolicy`] per
//! (router, address family) a session must be deployed on. The resolver is
//! pure: it reads the manifest, the global configuration and the registry
//! snapshot, and never touches disk or network.

use std::collections::BTreeMap;
use std::net::IpAddr;

use itertools::Itertools;
use sha2::{Digest, Sha256};

use crate::communities::{blackhole_communities, validate_as_set, validate_asn, Asn};
use crate::config::{
    GlobalConfig, GroupSettings, IxpConfig, Manifest, PeerDeclaration, PeerType, RouterConfig,
    SettingScope,
};
use crate::registry::PrefixLimits;
use crate::AddressFamily;

/// Default IPv4 prefix limit when neither the manifest nor the registry
/// provides one.
pub const DEFAULT_LIMIT_V4: u32 = 10_000;
/// Default IPv6 prefix limit.
pub const DEFAULT_LIMIT_V6: u32 = 1_000;

/// The fully resolved policy of one BGP session on one router.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSessionPolicy {
    pub asn: Asn,
    pub session_ip: IpAddr,
    pub family: AddressFamily,
    /// FQDN of the router the session is configured on.
    pub router: String,
    pub router_short: String,
    pub ixp: String,
    pub description: String,
    pub peer_type: PeerType,
    /// Import everything without a prefix filter (`import: ANY`).
    pub no_filter: bool,
    /// Export the full table instead of our own cone (`export: ANY`).
    pub export_full_table: bool,
    /// Name of the import filter function referenced by the session.
    pub filter_name: String,
    /// Name of the strict prefix set for this (ASN, family).
    pub prefix_set: String,
    /// Name of the loose prefix set used for blackhole acceptance.
    pub loose_prefix_set: String,
    /// Effective max-prefix limit for this address family.
    pub limit: u32,
    pub gtsm: bool,
    pub multihop: bool,
    pub disable_multihop_source_map: bool,
    pub password: Option<String>,
    /// Session source address of the router for this address family.
    pub source_address: IpAddr,
    pub ixp_community: Option<String>,
    pub local_pref: u32,
    pub admin_down_state: bool,
    pub graceful_shutdown: bool,
    pub block_importexport: bool,
    pub blackhole_accept: bool,
    pub blackhole_community: Vec<String>,
    pub rpki: bool,
    /// Deterministic protocol/neighbor name, unique per session and IXP.
    pub neighbor_name: String,
}

/// Accounting of one resolver pass.
#[derive(Debug, Default)]
pub struct ResolutionOutcome {
    /// One entry per (session, router) the manifest resolves to.
    pub policies: Vec<ResolvedSessionPolicy>,
    /// Manifest keys that were not valid ASNs.
    pub invalid_manifest_keys: usize,
    /// AS-SET/ASN tokens of import expressions that failed validation.
    pub invalid_import_tokens: usize,
    /// Declared peers for which no session address could be determined.
    pub peers_without_sessions: usize,
    /// Session addresses that matched an IXP peering LAN.
    pub sessions_matched: usize,
}

/// Resolver over one immutable snapshot of manifest, config and registry
/// data. Construct a fresh one per run.
pub struct PolicyResolver<'a> {
    config: &'a GlobalConfig,
    manifest: &'a Manifest,
    registry_sessions: &'a BTreeMap<u32, Vec<IpAddr>>,
    prefix_limits: &'a BTreeMap<Asn, PrefixLimits>,
}

impl<'a> PolicyResolver<'a> {
    pub fn new(
        config: &'a GlobalConfig,
        manifest: &'a Manifest,
        registry_sessions: &'a BTreeMap<u32, Vec<IpAddr>>,
        prefix_limits: &'a BTreeMap<Asn, PrefixLimits>,
    ) -> Self {
        Self {
            config,
            manifest,
            registry_sessions,
            prefix_limits,
        }
    }

    /// Resolve the complete manifest into per-router session policies.
    pub fn resolve_all(&self) -> ResolutionOutcome {
        let mut out = ResolutionOutcome {
            invalid_manifest_keys: self.manifest.invalid_asns.len(),
            ..Default::default()
        };

        for (asn, decl) in &self.manifest.peers {
            if !decl.is_unfiltered() {
                for token in decl.import_tokens() {
                    if !validate_as_set(token) && !validate_asn(token) {
                        log::error!("[{asn}] invalid AS-SET or ASN in import: {token}");
                        out.invalid_import_tokens += 1;
                    }
                }
            }

            let sessions = self.candidate_sessions(*asn, decl);
            if sessions.is_empty() {
                log::debug!("[{asn}] no sessions known, skipping peer");
                out.peers_without_sessions += 1;
                continue;
            }

            for session_ip in sessions {
                for (ixp_name, ixp) in &self.config.ixp_map {
                    if !ixp.contains(session_ip) {
                        continue;
                    }
                    out.sessions_matched += 1;

                    let local_pref = self.local_pref(*asn, decl, ixp_name, ixp, session_ip);
                    log::info!(
                        "found peer {session_ip} in IXP {ixp_name} with localpref {local_pref}"
                    );
                    log::debug!("must deploy on {}", ixp.present_on.iter().join(" "));

                    if decl.not_on.iter().any(|x| x == ixp_name) {
                        log::debug!("[{asn}] {ixp_name} is listed in not_on, skipping");
                        continue;
                    }

                    for fqdn in &ixp.present_on {
                        if let Some(only_on) = &decl.only_on {
                            if !only_on.contains(fqdn) {
                                continue;
                            }
                        }
                        let Some(router) = self.config.router_by_fqdn(fqdn) else {
                            log::warn!("[{ixp_name}] unknown router {fqdn}, skipping session");
                            continue;
                        };
                        out.policies.push(self.build_policy(
                            *asn, decl, session_ip, ixp_name, ixp, router, local_pref,
                        ));
                    }
                }
            }
        }

        out
    }

    /// Determine the candidate session addresses for a peer, in priority
    /// order: `only_with`, then `private_peerings`, then the registry
    /// sessions minus any `not_with` entries.
    fn candidate_sessions(&self, asn: Asn, decl: &PeerDeclaration) -> Vec<IpAddr> {
        if let Some(pinned) = &decl.only_with {
            return pinned.clone();
        }
        if let Some(private) = &decl.private_peerings {
            return private.clone();
        }
        let Some(registry) = self.registry_sessions.get(&asn.value()) else {
            return Vec::new();
        };
        let mut sessions = registry.clone();
        for raw in &decl.not_with {
            match raw.parse::<IpAddr>() {
                Ok(ip) => {
                    let before = sessions.len();
                    sessions.retain(|s| *s != ip);
                    if sessions.len() == before {
                        log::warn!(
                            "[{asn}] not_with address {ip} does not match any registry session"
                        );
                    }
                }
                Err(_) => log::error!("[{asn}] invalid IP address in not_with: {raw}"),
            }
        }
        sessions
    }

    #[allow(clippy::too_many_arguments)]
    fn build_policy(
        &self,
        asn: Asn,
        decl: &PeerDeclaration,
        session_ip: IpAddr,
        ixp_name: &str,
        ixp: &IxpConfig,
        router: &RouterConfig,
        local_pref: u32,
    ) -> ResolvedSessionPolicy {
        let family = AddressFamily::of(session_ip);
        let v = family.as_num();
        let ixprouter = format!("{ixp_name}-{}", router.short_name);

        let limit = match family {
            AddressFamily::Ipv4 => decl
                .ipv4_limit
                .or_else(|| self.prefix_limits.get(&asn).map(|l| l.v4))
                .unwrap_or(DEFAULT_LIMIT_V4),
            AddressFamily::Ipv6 => decl
                .ipv6_limit
                .or_else(|| self.prefix_limits.get(&asn).map(|l| l.v6))
                .unwrap_or(DEFAULT_LIMIT_V6),
        };

        let policy_name = format!("AUTOFILTER:{asn}:IPv{v}");
        let prefix_set = policy_name.replace(':', "_");
        let loose_prefix_set = prefix_set.replace("AUTOFILTER", "LOOSEFILTER");
        let filter_name = if decl.is_unfiltered() {
            "ebgp_unfiltered_peering_import".to_string()
        } else {
            format!("peer_in_{asn}_ipv{v}")
        };
        let neighbor_name = format!(
            "peer_{asn}_{}_{}",
            ixp_name.replace('-', ""),
            session_digest(session_ip)
        );

        ResolvedSessionPolicy {
            asn,
            session_ip,
            family,
            router: router.fqdn.clone(),
            router_short: router.short_name.clone(),
            ixp: ixp_name.to_string(),
            description: decl.description.clone(),
            peer_type: decl.peer_type,
            no_filter: decl.is_unfiltered(),
            export_full_table: decl.exports_full_table(),
            filter_name,
            prefix_set,
            loose_prefix_set,
            limit,
            gtsm: decl.gtsm,
            multihop: decl.multihop,
            disable_multihop_source_map: decl.disable_multihop_source_map,
            password: self.config.bgp_passwords.get(&asn).cloned(),
            source_address: router.source_address(family),
            ixp_community: ixp.ixp_community.clone(),
            local_pref,
            admin_down_state: self.flag(ixp_name, &ixprouter, None, |g| g.admin_down_state),
            graceful_shutdown: self.flag(ixp_name, &ixprouter, Some(router.graceful_shutdown), |g| {
                g.graceful_shutdown
            }),
            block_importexport: self.flag(ixp_name, &ixprouter, None, |g| g.block_importexport),
            blackhole_accept: decl.blackhole_accept,
            blackhole_community: decl.blackhole_community.clone().unwrap_or_else(|| {
                if decl.blackhole_accept {
                    // the legacy split encoding stays opt-in via the manifest
                    blackhole_communities(asn, true, false)
                } else {
                    vec!["65535:666".to_string()]
                }
            }),
            rpki: self.config.rpki,
            neighbor_name,
        }
    }

    /// Three-level flag precedence: the (IXP, router) pair setting, then the
    /// IXP setting, then the router-level value where one exists. The
    /// default is off; the first scope that switches the flag on wins.
    fn flag(
        &self,
        ixp: &str,
        ixprouter: &str,
        router_level: Option<bool>,
        get: impl Fn(&GroupSettings) -> Option<bool>,
    ) -> bool {
        if self.config.group(ixprouter).and_then(&get) == Some(true) {
            return true;
        }
        if self.config.group(ixp).and_then(&get) == Some(true) {
            return true;
        }
        router_level.unwrap_or(false)
    }

    /// Look up one overridable `u32` setting through the peer scopes:
    /// session address, then IXP, then the peer-common scope.
    fn setting(
        &self,
        asn: Asn,
        ixp_name: &str,
        session_ip: IpAddr,
        get: impl Fn(&SettingScope) -> Option<u32>,
    ) -> Option<u32> {
        let scopes = self.config.bgp_settings.get(&asn);
        scopes
            .and_then(|s| s.session.get(&session_ip).and_then(&get))
            .or_else(|| scopes.and_then(|s| s.ixp.get(ixp_name).and_then(&get)))
            .or_else(|| scopes.map(|s| get(&s.common)).unwrap_or(None))
    }

    /// The effective local preference for one session: peer scopes first,
    /// then the IXP default, then the hardcoded per-type fallback.
    fn local_pref(
        &self,
        asn: Asn,
        decl: &PeerDeclaration,
        ixp_name: &str,
        ixp: &IxpConfig,
        session_ip: IpAddr,
    ) -> u32 {
        self.setting(asn, ixp_name, session_ip, |s| s.bgp_local_pref)
            .or(ixp.bgp_local_pref)
            .unwrap_or_else(|| local_pref_default(decl.peer_type))
    }
}

/// The hardcoded local-pref fallback per peer type.
pub fn local_pref_default(peer_type: PeerType) -> u32 {
    match peer_type {
        PeerType::Downstream => 500,
        PeerType::Upstream => 60,
        PeerType::Peer => 100,
    }
}

/// Six base36 characters derived from the session address. Stable across
/// runs, so regenerating a config never renames existing protocols.
pub fn session_digest(ip: IpAddr) -> String {
    let digest = Sha256::digest(ip.to_string().as_bytes());
    let n = u128::from_be_bytes(digest[..16].try_into().expect("16 bytes"));
    to_base36(n).chars().take(6).collect()
}

fn to_base36(mut n: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).expect("ascii digits")
}
