/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Orchestrator: drives one end-to-end check, aggregating SPF, DKIM and
//! DMARC into a single [`Verdict`].
//!
//! Grounded on `examples/original_source/mail_engine.py::run_mail_check`
//! for the aggregation sequence and `api.py::CheckRequest` for the
//! boundary type's wire shape (spec.md §6). Binding an HTTP socket and
//! parsing the JSON body remain an external collaborator's job; this
//! module only exposes the typed `CheckRequest -> Verdict` function such
//! a front end would call into.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

use crate::dkim::{self, ArcInfo, DkimCheck, DkimConfig, DkimVerifier};
use crate::dmarc::{self, DmarcEvaluation};
use crate::dns::DnsClient;
use crate::error::CheckError;
use crate::spf::{self, SpfConfig, SpfResult};

/// Default per-request wall-clock deadline (spec.md §5).
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// Aggregated configuration for a single check, mirroring the teacher's
/// pattern of one `*Config` struct per component plus a top-level struct
/// that composes them for callers who want to override limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub spf: SpfConfig,
    pub dkim: DkimConfig,
    pub deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            spf: SpfConfig::default(),
            dkim: DkimConfig::default(),
            deadline: DEFAULT_DEADLINE,
        }
    }
}

/// A single candidate message to check, mirroring `api.py::CheckRequest`'s
/// wire shape (spec.md §6). Construction normalizes and validates: the
/// only way to obtain one is [`CheckRequest::new`], so a caller holding a
/// `CheckRequest` can rely on its invariants.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub domain: String,
    pub sender_ip: IpAddr,
    pub mail_from: Option<String>,
    pub helo: Option<String>,
    pub raw_message: Option<Vec<u8>>,
}

impl CheckRequest {
    pub fn new(
        domain: &str,
        sender_ip: &str,
        mail_from: Option<String>,
        helo: Option<String>,
        raw_message: Option<Vec<u8>>,
    ) -> Result<Self, CheckError> {
        let domain = crate::dns::normalize_domain(domain);
        if domain.is_empty() {
            return Err(CheckError::EmptyDomain);
        }
        let sender_ip = sender_ip
            .parse::<IpAddr>()
            .map_err(|_| CheckError::InvalidSenderIp {
                value: sender_ip.to_string(),
            })?;
        Ok(Self {
            domain,
            sender_ip,
            mail_from,
            helo,
            raw_message,
        })
    }
}

/// The wire-format request body for the (external) HTTP ingress, per
/// spec.md §6. Deserialized from JSON, then turned into a validated
/// [`CheckRequest`] via [`HttpCheckRequest::into_request`].
#[derive(Debug, Clone, Deserialize)]
pub struct HttpCheckRequest {
    pub domain: String,
    pub sender_ip: String,
    #[serde(default)]
    pub mail_from: Option<String>,
    #[serde(default)]
    pub helo: Option<String>,
    #[serde(default)]
    pub raw_email_b64: Option<String>,
}

impl HttpCheckRequest {
    /// Decodes `raw_email_b64` (strict base64, per spec.md §6) and builds
    /// a validated [`CheckRequest`].
    pub fn into_request(self) -> Result<CheckRequest, CheckError> {
        use base64::Engine;

        let raw_message = match self.raw_email_b64 {
            Some(encoded) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|_| CheckError::InvalidBase64)?,
            ),
            None => None,
        };
        CheckRequest::new(
            &self.domain,
            &self.sender_ip,
            self.mail_from,
            self.helo,
            raw_message,
        )
    }
}

/// One component's result plus the human-readable trace lines spec.md §6
/// calls for.
#[derive(Debug, Clone, Serialize)]
pub struct SpfOutcome {
    pub result: String,
    pub domain: String,
    pub trace: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DkimOutcome {
    pub performed: bool,
    pub result: String,
    pub domain: Option<String>,
    pub header_from_domain: Option<String>,
    pub signature_count: usize,
    pub arc: Option<ArcOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArcOutcome {
    pub present: bool,
    pub signer: Option<String>,
    pub note: Option<String>,
}

impl From<&ArcInfo> for ArcOutcome {
    fn from(info: &ArcInfo) -> Self {
        Self {
            present: info.present,
            signer: info.signer.clone(),
            note: info.note.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DmarcOutcome {
    pub present: bool,
    pub result: String,
    pub policy: Option<String>,
    pub enforcement: String,
    pub spf_aligned: bool,
    pub dkim_aligned: bool,
    pub reason: Option<String>,
}

/// The aggregated verdict for one check, per spec.md §3's `Verdict`
/// entity. The orchestrator never collapses one component's result into
/// another's (spec.md §7): all three are reported independently.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub spf: SpfOutcome,
    pub dkim: DkimOutcome,
    pub dmarc: DmarcOutcome,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spf={} dkim={} dmarc={} ({})",
            self.spf.result, self.dkim.result, self.dmarc.result, self.dmarc.enforcement
        )
    }
}

fn header_from_regex_angle() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^From:.*<[^@>]+@([^>]+)>")
            .expect("static pattern")
    })
}

fn header_from_regex_bare() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^From:.*@([^\s>]+)").expect("static pattern")
    })
}

/// Extracts the header-From domain from the raw message, per spec.md §4.8
/// step 3: prefer the address inside angle brackets, else the token
/// after `@`, lowercased with any trailing dot stripped.
pub fn extract_header_from_domain(raw_message: &[u8]) -> Option<String> {
    let headers = match find_subslice(raw_message, b"\r\n\r\n") {
        Some(pos) => &raw_message[..pos],
        None => raw_message,
    };

    let captured = header_from_regex_angle()
        .captures(headers)
        .or_else(|| header_from_regex_bare().captures(headers))?;
    let domain = captured.get(1)?.as_bytes();
    let domain = String::from_utf8_lossy(domain);
    Some(crate::dns::normalize_domain(domain.trim()))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

async fn with_deadline<T>(remaining: Duration, fut: impl Future<Output = T>) -> Option<T> {
    if remaining.is_zero() {
        return None;
    }
    tokio::time::timeout(remaining, fut).await.ok()
}

/// Runs one end-to-end check, per spec.md §4.8.
///
/// `dns` is a fresh, request-scoped [`DnsClient`] (its cache must not be
/// reused across requests, per spec.md §3's `EvalState` ownership rule).
/// `dkim_verifier` is the cryptographic oracle boundary (spec.md §4.6).
pub async fn run_check(
    request: &CheckRequest,
    dns: DnsClient,
    dkim_verifier: &dyn DkimVerifier,
    config: &EngineConfig,
) -> Verdict {
    let span = tracing::info_span!("mail_check", domain = %request.domain);
    let _enter = span.enter();

    let deadline_start = Instant::now();
    let mail_from = request.mail_from.as_deref().unwrap_or("");
    let helo = request.helo.as_deref().unwrap_or("");

    let spf_domain = match mail_from.split_once('@') {
        Some((_, domain)) if !domain.is_empty() => crate::dns::normalize_domain(domain),
        _ => request.domain.clone(),
    };

    tracing::debug!(spf_domain = %spf_domain, "starting SPF evaluation");

    let remaining = config.deadline.saturating_sub(deadline_start.elapsed());
    let (spf_result, spf_trace) = match with_deadline(
        remaining,
        spf::run(&spf_domain, request.sender_ip, mail_from, helo, dns.clone(), &config.spf),
    )
    .await
    {
        Some(outcome) => outcome,
        None => (
            SpfResult::TempError("per-request deadline exceeded".to_string()),
            Vec::new(),
        ),
    };

    let header_from = request
        .raw_message
        .as_deref()
        .and_then(extract_header_from_domain)
        .unwrap_or_else(|| request.domain.clone());

    let dkim_check: Option<DkimCheck> = match &request.raw_message {
        Some(raw) => {
            let remaining = config.deadline.saturating_sub(deadline_start.elapsed());
            with_deadline(
                remaining,
                dkim::check(raw, &header_from, dkim_verifier, &config.dkim),
            )
            .await
        }
        None => None,
    };

    let dkim_result_is_pass = dkim_check.as_ref().map(|c| c.result.is_pass()).unwrap_or(false);
    let dkim_domain = dkim_check.as_ref().and_then(|c| c.selected_domain.clone());

    let remaining = config.deadline.saturating_sub(deadline_start.elapsed());
    let dmarc_eval: DmarcEvaluation = match with_deadline(
        remaining,
        dmarc::evaluate(
            &header_from,
            spf_result.is_pass(),
            Some(spf_domain.as_str()),
            dkim_result_is_pass,
            dkim_domain.as_deref(),
            &dns,
        ),
    )
    .await
    {
        Some(eval) => eval,
        None => DmarcEvaluation {
            present: false,
            result: dmarc::DmarcResult::TempError("per-request deadline exceeded".to_string()),
            policy: None,
            spf_aligned: false,
            dkim_aligned: false,
            enforcement: dmarc::Enforcement::Allow,
            reason: Some("per-request deadline exceeded".to_string()),
        },
    };

    tracing::debug!(
        spf = %spf_result,
        dmarc = %dmarc_eval.result,
        "check complete"
    );

    Verdict {
        spf: SpfOutcome {
            result: spf_result.to_string(),
            domain: spf_domain,
            trace: spf_trace,
        },
        dkim: match &dkim_check {
            Some(check) => DkimOutcome {
                performed: true,
                result: check.result.to_string(),
                domain: check.selected_domain.clone(),
                header_from_domain: Some(header_from.clone()),
                signature_count: check.signatures.len(),
                arc: Some(ArcOutcome::from(&check.arc)),
            },
            None => DkimOutcome {
                performed: false,
                result: crate::dkim::DkimResult::None.to_string(),
                domain: None,
                header_from_domain: request.raw_message.as_ref().map(|_| header_from.clone()),
                signature_count: 0,
                arc: None,
            },
        },
        dmarc: DmarcOutcome {
            present: dmarc_eval.present,
            result: dmarc_eval.result.to_string(),
            policy: dmarc_eval.policy.as_ref().map(|p| p.p.to_string()),
            enforcement: dmarc_eval.enforcement.to_string(),
            spf_aligned: dmarc_eval.spf_aligned,
            dkim_aligned: dmarc_eval.dkim_aligned,
            reason: dmarc_eval.reason,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_angle_bracket_address() {
        let msg = b"From: Alice <alice@mail.example.com>\r\nTo: bob@test.com\r\n\r\nbody";
        assert_eq!(
            extract_header_from_domain(msg),
            Some("mail.example.com".to_string())
        );
    }

    #[test]
    fn extracts_bare_address_without_angle_brackets() {
        let msg = b"From: alice@mail.example.com\r\n\r\nbody";
        assert_eq!(
            extract_header_from_domain(msg),
            Some("mail.example.com".to_string())
        );
    }

    #[test]
    fn missing_from_header_is_none() {
        let msg = b"To: bob@test.com\r\n\r\nbody";
        assert_eq!(extract_header_from_domain(msg), None);
    }

    #[test]
    fn check_request_rejects_invalid_ip() {
        let err = CheckRequest::new("example.com", "not-an-ip", None, None, None).unwrap_err();
        assert!(matches!(err, CheckError::InvalidSenderIp { .. }));
    }

    #[test]
    fn check_request_rejects_empty_domain() {
        let err = CheckRequest::new("", "192.0.2.1", None, None, None).unwrap_err();
        assert_eq!(err, CheckError::EmptyDomain);
    }

    #[test]
    fn http_request_rejects_invalid_base64() {
        let http = HttpCheckRequest {
            domain: "example.com".to_string(),
            sender_ip: "192.0.2.1".to_string(),
            mail_from: None,
            helo: None,
            raw_email_b64: Some("not valid base64 !!!".to_string()),
        };
        assert_eq!(http.into_request().unwrap_err(), CheckError::InvalidBase64);
    }

    #[test]
    fn http_request_decodes_valid_base64() {
        use base64::Engine;
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(b"From: a@b.com\r\n\r\nbody");
        let http = HttpCheckRequest {
            domain: "example.com".to_string(),
            sender_ip: "192.0.2.1".to_string(),
            mail_from: None,
            helo: None,
            raw_email_b64: Some(encoded),
        };
        let request = http.into_request().unwrap();
        assert_eq!(
            request.raw_message.as_deref(),
            Some(&b"From: a@b.com\r\n\r\nbody"[..])
        );
    }
}
