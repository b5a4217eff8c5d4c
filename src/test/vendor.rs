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

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use crate::config::{GlobalConfig, PeerType};
use crate::policy::ResolvedSessionPolicy;
use crate::test::{session_policy, test_config};
use crate::vendor::{
    quick_syntax_check, Bird2Plugin, PluginError, PluginInfo, PluginRegistry, PluginState,
    StubPlugin, TemplateVars, VendorPlugin,
};

/// A minimal always-available plugin for registry tests.
struct FakePlugin {
    name: &'static str,
}

#[async_trait]
impl VendorPlugin for FakePlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.to_string(),
            version: "1.0.0".to_string(),
            description: "test double".to_string(),
            capabilities: Vec::new(),
            enabled: true,
        }
    }

    async fn initialize(&mut self) -> bool {
        true
    }

    fn generate_config(
        &self,
        _peer: &ResolvedSessionPolicy,
        _vars: &TemplateVars,
    ) -> Result<String, PluginError> {
        Ok(String::from("# fake\n"))
    }

    async fn validate_config(&self, _config: &str) -> bool {
        true
    }

    fn supported_features(&self) -> Vec<&'static str> {
        vec!["fake"]
    }
}

fn config_without_bird() -> GlobalConfig {
    GlobalConfig::parse(
        r#"
bgp:
  dc1-1:
    fqdn: dc1-1.router.example.net
    ipv4: 192.0.2.1
    ipv6: 2001:db8::1
ixp_map:
  AMS-IX:
    ipv4_range: 80.249.208.0/21
    ipv6_range: 2001:7f8:1::/64
    present_on:
      - dc1-1.router.example.net
local_asn: AS64496
deploy:
  bird_bin: /nonexistent/bird
  birdc_bin: /nonexistent/birdc
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn registry_lookup_is_substring_and_case_insensitive() {
    let mut registry = PluginRegistry::empty();
    registry.register(Box::new(FakePlugin { name: "bird2" }));
    registry.register(Box::new(StubPlugin::juniper()));
    registry.initialize_all().await;

    assert!(registry.get("bird2").is_some());
    assert!(registry.get("BIRD2").is_some());
    // a plain `bird` vendor tag resolves to the bird2 plugin
    assert!(registry.get("bird").is_some());
    // the juniper stub failed initialization and is not active
    assert!(registry.get("juniper").is_none());
    assert!(registry.get("cisco").is_none());
}

#[tokio::test]
async fn failed_plugins_are_reported_disabled() {
    let mut registry = PluginRegistry::empty();
    registry.register(Box::new(FakePlugin { name: "bird2" }));
    registry.register(Box::new(StubPlugin::openbgpd()));
    registry.initialize_all().await;

    assert_eq!(registry.active_count(), 1);
    let listed = registry.list();
    assert_eq!(listed.len(), 2);
    let stub = listed.iter().find(|(info, _)| info.name == "openbgpd").unwrap();
    assert!(!stub.0.enabled);
    assert_eq!(stub.1, PluginState::FailedInit);
    let active = listed.iter().find(|(info, _)| info.name == "bird2").unwrap();
    assert!(active.0.enabled);
    assert_eq!(active.1, PluginState::Active);
}

#[tokio::test]
async fn stubs_never_render() {
    let stub = StubPlugin::cisco();
    let vars = TemplateVars::from_config(&test_config());
    assert!(matches!(
        stub.generate_config(&session_policy(), &vars),
        Err(PluginError::NotImplemented(_))
    ));
    assert!(!stub.validate_config("protocol device {}\n").await);
}

#[test]
fn bird2_session_stanza() {
    let config = config_without_bird();
    let plugin = Bird2Plugin::new(&config);
    let vars = TemplateVars::from_config(&config);
    let peer = session_policy();

    let rendered = plugin.generate_config(&peer, &vars).unwrap();
    assert!(rendered.contains("protocol bgp peer_AS64500_AMSIX_1A2B3C {"));
    assert!(rendered.contains("description \"AS64500 -- Example peer\";"));
    assert!(rendered.contains("local as 64496;"));
    assert!(rendered.contains("neighbor 80.249.208.1 as 64500;"));
    assert!(rendered.contains("default bgp_local_pref 100;"));
    assert!(rendered.contains("import limit 1100 action restart;"));
    assert!(rendered.contains("import filter peer_in_AS64500_ipv4;"));
    assert!(rendered.contains("export all;"));
    assert!(!rendered.contains("disabled;"));
    assert!(!rendered.contains("ttl security"));
    assert!(!rendered.contains("password"));
}

#[test]
fn bird2_session_stanza_flags() {
    let config = config_without_bird();
    let plugin = Bird2Plugin::new(&config);
    let vars = TemplateVars::from_config(&config);

    let mut peer = session_policy();
    peer.admin_down_state = true;
    peer.gtsm = true;
    peer.multihop = true;
    peer.password = Some("sekrit".to_string());
    peer.graceful_shutdown = true;
    peer.export_full_table = false;
    peer.peer_type = PeerType::Upstream;

    let rendered = plugin.generate_config(&peer, &vars).unwrap();
    assert!(rendered.contains("disabled;"));
    assert!(rendered.contains("ttl security on;"));
    assert!(rendered.contains("multihop 255;"));
    assert!(rendered.contains("source address 192.0.2.1;"));
    assert!(rendered.contains("password \"sekrit\";"));
    // graceful shutdown drains the session
    assert!(rendered.contains("default bgp_local_pref 0;"));
    assert!(!rendered.contains("default bgp_local_pref 100;"));
    assert!(rendered.contains("export filter ebgp_export_cone;"));
    assert!(rendered.contains("default bgp_med 0;"));
}

#[test]
fn bird2_blocked_session_imports_nothing() {
    let config = config_without_bird();
    let plugin = Bird2Plugin::new(&config);
    let vars = TemplateVars::from_config(&config);

    let mut peer = session_policy();
    peer.block_importexport = true;

    let rendered = plugin.generate_config(&peer, &vars).unwrap();
    assert!(rendered.contains("import none;"));
    assert!(rendered.contains("export none;"));
    assert!(!rendered.contains("import filter"));
}

#[test]
fn bird2_filter_stanza() {
    let config = config_without_bird();
    let plugin = Bird2Plugin::new(&config);

    let mut peer = session_policy();
    peer.rpki = true;
    peer.blackhole_accept = true;
    peer.ixp_community = Some("65500:120".to_string());

    let rendered = plugin.generate_filter_config(&peer).unwrap();
    assert!(rendered.contains("filter peer_in_AS64500_ipv4"));
    assert!(rendered.contains("if ! (net ~ AUTOFILTER_AS64500_IPv4) then reject;"));
    assert!(rendered.contains("roa_check(roa_v4, net, bgp_path.last)"));
    assert!(rendered.contains("((65535, 666) ~ bgp_community)"));
    assert!(rendered.contains("if net ~ LOOSEFILTER_AS64500_IPv4 then accept;"));
    assert!(rendered.contains("bgp_community.add((65500, 120));"));
    assert!(rendered.ends_with("\n"));

    // unfiltered peers share a static import filter instead
    let mut unfiltered = session_policy();
    unfiltered.no_filter = true;
    assert_eq!(plugin.generate_filter_config(&unfiltered).unwrap(), "");
}

#[test]
fn bird2_filter_and_session_parse_cleanly() {
    let config = config_without_bird();
    let plugin = Bird2Plugin::new(&config);
    let vars = TemplateVars::from_config(&config);
    let peer = session_policy();

    let mut full = plugin.generate_filter_config(&peer).unwrap();
    full.push_str(&plugin.generate_config(&peer, &vars).unwrap());
    assert!(quick_syntax_check(&full));
}

#[tokio::test]
async fn bird2_validation_without_daemon_uses_grammar_check() {
    let config = config_without_bird();
    let plugin = Bird2Plugin::new(&config);

    assert!(plugin.validate_config("protocol device {\n}\n").await);
    assert!(!plugin.validate_config("protocol device {\n").await);
    assert!(!plugin.validate_config("}\nprotocol device {\n").await);
    assert!(!plugin.validate_config("   \n").await);
    assert!(!plugin.validate_config("password \"unterminated;\n{}").await);
}

#[test]
fn quick_syntax_check_ignores_braces_in_strings() {
    assert!(quick_syntax_check("password \"{\";\nprotocol device {\n}\n"));
    assert!(!quick_syntax_check("password \"x\";\n}{\n"));
}

#[tokio::test]
async fn default_registry_contains_all_vendors() {
    let config = config_without_bird();
    let mut registry = PluginRegistry::with_default_plugins(&config);
    registry.initialize_all().await;

    let names: Vec<String> = registry.list().into_iter().map(|(i, _)| i.name).collect();
    for vendor in ["bird2", "bird1", "cisco", "frr", "juniper", "openbgpd", "exabgp"] {
        assert!(names.contains(&vendor.to_string()), "missing {vendor}");
    }
    // the bird binary does not exist here, so nothing can be active
    assert_eq!(registry.active_count(), 0);
}
