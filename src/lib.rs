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

//! This library compiles a declarative peering manifest into per-router BGP
//! configuration and rolls it out to a fleet of edge routers.
//!
//! # Pipeline
//!
//! A generation run flows through the following stages:
//!
//! 1. The [`registry::RegistryClient`] pulls the session addresses and
//!    advertised prefix counts of all networks from PeeringDB, with mirror
//!    fallback and a compressed on-disk cache.
//! 2. The [`policy::PolicyResolver`] matches every declared peer against
//!    the IXP peering LANs and computes the effective per-session policy
//!    (local preference, prefix limits, GTSM, multihop, blackhole settings,
//!    administrative state) through a layered precedence lookup.
//! 3. The [`filters::FilterGenerator`] materializes IRR-based prefix
//!    filter sets by invoking the external `bgpq3` tool, one bounded worker
//!    per ASN, with a one-hour artifact cache.
//! 4. A [`vendor::VendorPlugin`] renders each resolved session into
//!    vendor-native configuration text. BIRD 2 is the production renderer;
//!    the other vendors are registered as explicit stubs.
//! 5. The [`deploy::Deployer`] validates the environment and the staged
//!    trees, then ships the configuration to the routers over rsync + SSH
//!    with bounded parallelism and a batch deadline.
//! 6. The [`state::StateStore`] keeps a durable record of every
//!    generation, deployment and discrete event in SQLite.
//!
//! # Service construction
//!
//! There is no global state: every run constructs its own configuration,
//! registry client, plugin registry and state store, and passes them into
//! [`generate::Generator`] or [`deploy::Deployer`]. Two runs can therefore
//! coexist in one process, and tests can wire up the pieces in isolation.

use std::net::IpAddr;
use std::path::Path;

use thiserror::Error;

pub mod communities;
pub mod config;
pub mod deploy;
pub mod filters;
pub mod generate;
pub mod policy;
pub mod registry;
pub mod ssh;
pub mod state;
pub mod vendor;

#[cfg(test)]
mod test;

pub use communities::Asn;
pub use config::{GlobalConfig, Manifest, PeerDeclaration};
pub use deploy::Deployer;
pub use generate::Generator;
pub use policy::{PolicyResolver, ResolvedSessionPolicy};
pub use registry::RegistryClient;
pub use state::StateStore;
pub use vendor::PluginRegistry;

/// The two BGP address families the pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// The family of the given address.
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// The numeric family tag used in filenames and stanza names.
    pub fn as_num(self) -> u8 {
        match self {
            AddressFamily::Ipv4 => 4,
            AddressFamily::Ipv6 => 6,
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ipv{}", self.as_num())
    }
}

/// Whether the path points to an existing executable file.
pub(crate) fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    true
}

/// Error type thrown by the peering pipeline.
#[derive(Debug, Error)]
pub enum AutopeerError {
    /// Configuration or manifest problem.
    #[error("{0}")]
    Config(#[from] config::ConfigError),
    /// All registry sources exhausted or unusable.
    #[error("{0}")]
    Registry(#[from] registry::RegistryError),
    /// Filter generation failure.
    #[error("{0}")]
    Filter(#[from] filters::FilterError),
    /// Vendor plugin failure.
    #[error("{0}")]
    Plugin(#[from] vendor::PluginError),
    /// Deployment failure.
    #[error("{0}")]
    Deploy(#[from] deploy::DeployError),
    /// State store failure.
    #[error("{0}")]
    State(#[from] state::StateError),
    /// SSH transport failure.
    #[error("Session error: {0}")]
    Ssh(#[from] ssh::SshError),
    /// I/O error.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Formatting error.
    #[error("{0}")]
    Fmt(#[from] std::fmt::Error),
    /// Cannot join a parallel job.
    #[error("Cannot join task: {0}")]
    Join(#[from] tokio::task::JoinError),
}
