/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! `mailauth-check` evaluates SPF, DKIM and DMARC against a single
//! candidate message and produces a structured verdict plus a
//! human-readable decision trace.
//!
//! The crate is a library: the HTTP ingress, interactive CLI, and
//! pretty-printed tree rendering named in the specification this crate
//! implements are external collaborators this crate does not bind or
//! parse itself. What it exposes is the evaluation engine those front
//! ends call into — [`orchestrator::run_check`] taking an
//! [`orchestrator::CheckRequest`] and returning an
//! [`orchestrator::Verdict`] — plus the individual SPF, DKIM and DMARC
//! components for callers that only need one piece.
//!
//! ```no_run
//! use mailauth_check::dns::{DnsClient, HickoryResolver};
//! use mailauth_check::orchestrator::{CheckRequest, EngineConfig};
//! use std::sync::Arc;
//!
//! struct NoopDkim;
//! #[async_trait::async_trait]
//! impl mailauth_check::dkim::DkimVerifier for NoopDkim {
//!     async fn verify(&self, _raw: &[u8]) -> mailauth_check::dkim::DkimResult {
//!         mailauth_check::dkim::DkimResult::None
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = Arc::new(HickoryResolver::from_system_conf()?);
//! let dns = DnsClient::new(resolver);
//! let request = CheckRequest::new("example.com", "192.0.2.10", None, None, None)?;
//! let verdict = mailauth_check::orchestrator::run_check(
//!     &request,
//!     dns,
//!     &NoopDkim,
//!     &EngineConfig::default(),
//! )
//! .await;
//! println!("{verdict}");
//! # Ok(())
//! # }
//! ```

pub mod dkim;
pub mod dmarc;
pub mod dns;
pub mod error;
pub mod orchestrator;
pub mod spf;
pub mod time;

pub use error::{CheckError, DnsError};
pub use orchestrator::{CheckRequest, EngineConfig, HttpCheckRequest, Verdict};
