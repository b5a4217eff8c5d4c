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

//! Materialization of IRR-derived prefix filter sets. Each (ASN, address
//! family, strictness) triple maps to one artifact file produced by the
//! external `bgpq3` tool and reused for up to an hour. Generation runs one
//! task per ASN over a bounded worker pool; a failing ASN never takes the
//! rest of the batch down with it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::communities::Asn;
use crate::AddressFamily;

/// Cached artifacts younger than this are reused without invoking bgpq3.
pub const FILTER_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Size of the filter worker pool. Fixed, independent of the peer count.
pub const FILTER_WORKERS: usize = 10;

/// Filter strictness. Loose filters only cap the prefix length at the
/// maximum the family allows and exist for blackhole-accepting peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    Strict,
    Loose,
}

impl Strictness {
    fn stanza_prefix(self) -> &'static str {
        match self {
            Strictness::Strict => "AUTOFILTER",
            Strictness::Loose => "LOOSEFILTER",
        }
    }

    fn file_prefix(self) -> &'static str {
        match self {
            Strictness::Strict => "prefixset",
            Strictness::Loose => "looseprefixset",
        }
    }

    /// The `-R` max-prefix-length ceiling passed to bgpq3.
    pub fn max_prefix_length(self, family: AddressFamily) -> &'static str {
        match (self, family) {
            (Strictness::Strict, AddressFamily::Ipv4) => "24",
            (Strictness::Strict, AddressFamily::Ipv6) => "48",
            (Strictness::Loose, AddressFamily::Ipv4) => "32",
            (Strictness::Loose, AddressFamily::Ipv6) => "128",
        }
    }
}

/// Filter work for one ASN.
#[derive(Debug, Clone)]
pub struct FilterRequest {
    pub asn: Asn,
    /// AS-SET/ASN tokens of the import expression.
    pub tokens: Vec<String>,
    /// IRR source order for this peer.
    pub irr_order: String,
    /// Also build the loose variant.
    pub blackhole_accept: bool,
}

/// Result of one ASN's filter task. Failures are values, not panics, so the
/// orchestrator can aggregate them.
#[derive(Debug)]
pub struct FilterOutcome {
    pub asn: Asn,
    pub messages: Vec<String>,
    pub error: Option<String>,
}

impl FilterOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Generator invoking bgpq3 into a working directory of artifact files.
#[derive(Debug, Clone)]
pub struct FilterGenerator {
    pub workdir: PathBuf,
    pub irr_host: String,
    pub bgpq3_bin: PathBuf,
    pub workers: usize,
}

impl FilterGenerator {
    pub fn new(workdir: impl Into<PathBuf>, irr_host: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            irr_host: irr_host.into(),
            bgpq3_bin: PathBuf::from("bgpq3"),
            workers: FILTER_WORKERS,
        }
    }

    /// Run all requests over the worker pool and collect each outcome as it
    /// completes. A panicking or failing task is logged and reported in its
    /// outcome; siblings keep running.
    pub async fn generate_all(&self, requests: Vec<FilterRequest>) -> Vec<FilterOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut jobs = JoinSet::new();
        for request in requests {
            let generator = self.clone();
            let semaphore = semaphore.clone();
            jobs.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                let asn = request.asn;
                match generator.generate_for_request(&request).await {
                    Ok(messages) => FilterOutcome {
                        asn,
                        messages,
                        error: None,
                    },
                    Err(e) => FilterOutcome {
                        asn,
                        messages: Vec::new(),
                        error: Some(e.to_string()),
                    },
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Some(error) = &outcome.error {
                        log::error!("[{}] filter generation failed: {error}", outcome.asn);
                    }
                    outcomes.push(outcome);
                }
                Err(e) => log::error!("filter worker panicked: {e}"),
            }
        }
        outcomes
    }

    /// Generate the strict filters of one ASN, plus the loose variant when
    /// the peer accepts blackhole routes.
    pub async fn generate_for_request(
        &self,
        request: &FilterRequest,
    ) -> Result<Vec<String>, FilterError> {
        let mut messages = self.generate_filters(request, Strictness::Strict).await?;
        if request.blackhole_accept {
            messages.extend(self.generate_filters(request, Strictness::Loose).await?);
        }
        Ok(messages)
    }

    async fn generate_filters(
        &self,
        request: &FilterRequest,
        strictness: Strictness,
    ) -> Result<Vec<String>, FilterError> {
        let mut messages = Vec::new();

        // unfiltered peers have no prefix sets
        if request.tokens == ["ANY"] {
            return Ok(messages);
        }

        for family in [AddressFamily::Ipv4, AddressFamily::Ipv6] {
            let filename = filter_filename(request.asn, family, strictness);
            let path = self.workdir.join(&filename);
            let verb = if path.exists() {
                if artifact_fresh(&path, FILTER_CACHE_TTL) {
                    let message = format!("bird ipv{} cached: {filename}", family.as_num());
                    log::info!("{message}");
                    messages.push(message);
                    continue;
                }
                "refreshed"
            } else {
                "created"
            };

            match self.run_bgpq3(&path, request, family, strictness).await {
                Ok(()) => {
                    let message = format!("bird ipv{} {verb}: {filename}", family.as_num());
                    log::info!("{message}");
                    messages.push(message);
                }
                Err(FilterError::NonZeroExit { file, code }) => {
                    // partial failure of one filter must not abort the batch
                    log::error!("bgpq3 returned non-zero for {file}: {code}");
                    messages.push(format!("bgpq3 failed for {file} (exit {code})"));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(messages)
    }

    async fn run_bgpq3(
        &self,
        path: &Path,
        request: &FilterRequest,
        family: AddressFamily,
        strictness: Strictness,
    ) -> Result<(), FilterError> {
        let stanza = stanza_name(request.asn, family, strictness);
        let output = std::fs::File::create(path)?;

        let mut cmd = tokio::process::Command::new(&self.bgpq3_bin);
        cmd.arg("-h")
            .arg(&self.irr_host)
            .arg("-S")
            .arg(&request.irr_order)
            .arg("-R")
            .arg(strictness.max_prefix_length(family))
            .arg(format!("-{}", family.as_num()))
            .arg("-b")
            .arg("-l")
            .arg(&stanza)
            .arg("-A")
            .arg(request.asn.to_string())
            .args(&request.tokens)
            .stdout(Stdio::from(output))
            .kill_on_drop(true);
        log::trace!("[tokio::process::Command] {cmd:?}");

        let start = Instant::now();
        let status = cmd.status().await?;
        log::debug!(
            "[{}] bgpq3 for {stanza} finished in {:.2?}",
            request.asn,
            start.elapsed()
        );

        if status.success() {
            Ok(())
        } else {
            Err(FilterError::NonZeroExit {
                file: path.display().to_string(),
                code: status.code().unwrap_or(-1),
            })
        }
    }
}

/// The artifact filename of one (ASN, family, strictness) triple.
pub fn filter_filename(asn: Asn, family: AddressFamily, strictness: Strictness) -> String {
    format!("{asn}.{}.bird.ipv{}", strictness.file_prefix(), family.as_num())
}

/// The stanza label passed to bgpq3 (`-l`).
pub fn stanza_name(asn: Asn, family: AddressFamily, strictness: Strictness) -> String {
    format!("{}_{asn}_IPv{}", strictness.stanza_prefix(), family.as_num())
}

/// Whether the artifact at `path` is younger than `ttl`.
pub fn artifact_fresh(path: &Path, ttl: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age <= ttl)
        .unwrap_or(false)
}

/// Whether any strict prefix set exists for the ASN. Used by the generation
/// run to report peers whose filters were never built.
pub fn has_prefix_sets(workdir: &Path, asn: Asn) -> bool {
    [AddressFamily::Ipv4, AddressFamily::Ipv6]
        .into_iter()
        .any(|family| workdir.join(filter_filename(asn, family, Strictness::Strict)).exists())
}

/// Error kind returned by the [`FilterGenerator`].
#[derive(Debug, Error)]
pub enum FilterError {
    /// I/O error while preparing or writing an artifact.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The IRR query tool exited with a non-zero code.
    #[error("bgpq3 returned non-zero exit code {code} for {file}")]
    NonZeroExit { file: String, code: i32 },
}
