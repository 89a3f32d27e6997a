/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! DMARC Evaluator: policy fetch/parse, SPF/DKIM alignment, the `pct`
//! sampling rule, and enforcement mapping.
//!
//! Grounded on `examples/original_source/dmarc_evaluator.py::evaluate_dmarc`.
//! The organizational-domain reduction the Python prototype gets from
//! `publicsuffix2.get_sld` is the `psl` crate here (spec.md §1 treats
//! `orgDomain` as an opaque external collaborator), matching the usage
//! pattern in `examples/other_examples/ac141f07_xlh001-mail-server__crates-smtp-src-inbound-data.rs.rs`
//! (`psl::domain_str(domain).unwrap_or(domain)`).

use std::fmt;

use sha2::{Digest, Sha256};

use crate::dns::{DnsClient, DnsStatus};

/// Reduces a domain to its organizational (registrable) domain via the
/// public suffix list. Falls back to the input domain unchanged when
/// `psl` cannot classify it (e.g. a bare TLD or already-minimal name).
pub fn org_domain(domain: &str) -> String {
    psl::domain_str(domain).unwrap_or(domain).to_string()
}

/// DMARC alignment mode for the `aspf`/`adkim` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentMode {
    Relaxed,
    Strict,
}

impl AlignmentMode {
    fn from_tag(value: &str) -> AlignmentMode {
        match value.to_ascii_lowercase().as_str() {
            "s" => AlignmentMode::Strict,
            _ => AlignmentMode::Relaxed,
        }
    }
}

impl fmt::Display for AlignmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentMode::Relaxed => write!(f, "r"),
            AlignmentMode::Strict => write!(f, "s"),
        }
    }
}

/// Tests whether `auth_domain` aligns with `from_domain` under `mode`,
/// per spec.md §4.7.
pub fn aligned(auth_domain: Option<&str>, from_domain: &str, mode: AlignmentMode) -> bool {
    let Some(auth_domain) = auth_domain else {
        return false;
    };
    if auth_domain.is_empty() {
        return false;
    }
    match mode {
        AlignmentMode::Strict => auth_domain.eq_ignore_ascii_case(from_domain),
        AlignmentMode::Relaxed => {
            org_domain(auth_domain).eq_ignore_ascii_case(&org_domain(from_domain))
        }
    }
}

/// The three DMARC dispositions a `p=`/`sp=` tag can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyValue {
    None,
    Quarantine,
    Reject,
}

impl PolicyValue {
    fn from_tag(value: &str) -> PolicyValue {
        match value.to_ascii_lowercase().as_str() {
            "quarantine" => PolicyValue::Quarantine,
            "reject" => PolicyValue::Reject,
            _ => PolicyValue::None,
        }
    }
}

impl fmt::Display for PolicyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyValue::None => write!(f, "none"),
            PolicyValue::Quarantine => write!(f, "quarantine"),
            PolicyValue::Reject => write!(f, "reject"),
        }
    }
}

/// A parsed DMARC policy record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcPolicy {
    pub p: PolicyValue,
    pub sp: Option<PolicyValue>,
    pub aspf: AlignmentMode,
    pub adkim: AlignmentMode,
    pub pct: u8,
    /// The domain the record was actually found at: either the header-From
    /// domain or its organizational domain.
    pub location: String,
    pub raw: String,
}

fn parse_policy(record: &str, location: &str) -> DmarcPolicy {
    let mut p = PolicyValue::None;
    let mut sp = None;
    let mut aspf = AlignmentMode::Relaxed;
    let mut adkim = AlignmentMode::Relaxed;
    let mut pct: u8 = 100;

    for part in record.split(';') {
        let part = part.trim();
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "p" => p = PolicyValue::from_tag(value),
            "sp" => sp = Some(PolicyValue::from_tag(value)),
            "aspf" => aspf = AlignmentMode::from_tag(value),
            "adkim" => adkim = AlignmentMode::from_tag(value),
            "pct" => pct = value.parse().unwrap_or(100).min(100),
            _ => {}
        }
    }

    DmarcPolicy {
        p,
        sp,
        aspf,
        adkim,
        pct,
        location: location.to_string(),
        raw: record.to_string(),
    }
}

fn is_dmarc_record(record: &str) -> bool {
    let lower = record.to_ascii_lowercase();
    lower == "v=dmarc1"
        || lower
            .split(';')
            .next()
            .map(|first| first.trim() == "v=dmarc1")
            .unwrap_or(false)
}

/// Outcome of locating a DMARC record, before policy parsing.
enum Located {
    Found { location: String, record: String },
    None,
    PermError(String),
    TempError(String),
}

async fn locate(header_from: &str, dns: &DnsClient) -> Located {
    let org = org_domain(header_from);
    let mut candidates = vec![header_from.to_string()];
    if org != header_from {
        candidates.push(org);
    }

    for target in candidates {
        let name = format!("_dmarc.{target}");
        let answer = dns.lookup_txt(&name).await;
        match answer.status {
            DnsStatus::Transient => {
                return Located::TempError(format!("DNS transient failure for {name}"))
            }
            DnsStatus::NxDomain | DnsStatus::NoData => continue,
            DnsStatus::Ok => {}
        }

        let matches: Vec<&str> = answer
            .records
            .iter()
            .map(|r| r.trim())
            .filter(|r| is_dmarc_record(r))
            .collect();

        match matches.len() {
            0 => continue,
            1 => {
                return Located::Found {
                    location: target,
                    record: matches[0].to_string(),
                }
            }
            _ => return Located::PermError("multiple DMARC records".to_string()),
        }
    }

    Located::None
}

/// Final SPF/DKIM alignment plus enforcement decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmarcResult {
    Pass,
    Fail,
    None,
    TempError(String),
    PermError(String),
}

impl fmt::Display for DmarcResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmarcResult::Pass => write!(f, "PASS"),
            DmarcResult::Fail => write!(f, "FAIL"),
            DmarcResult::None => write!(f, "NONE"),
            DmarcResult::TempError(reason) => write!(f, "TEMPERROR ({reason})"),
            DmarcResult::PermError(reason) => write!(f, "PERMERROR ({reason})"),
        }
    }
}

/// The action a DMARC evaluation recommends the orchestrator's caller
/// take, per spec.md §4.7's enforcement mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enforcement {
    Allow,
    AllowMonitoring,
    AllowPctSampling,
    Quarantine,
    Reject,
}

impl fmt::Display for Enforcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Enforcement::Allow => write!(f, "ALLOW"),
            Enforcement::AllowMonitoring => write!(f, "ALLOW (monitoring)"),
            Enforcement::AllowPctSampling => write!(f, "ALLOW (pct sampling)"),
            Enforcement::Quarantine => write!(f, "QUARANTINE"),
            Enforcement::Reject => write!(f, "REJECT"),
        }
    }
}

/// Complete DMARC evaluation for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcEvaluation {
    pub present: bool,
    pub result: DmarcResult,
    pub policy: Option<DmarcPolicy>,
    pub spf_aligned: bool,
    pub dkim_aligned: bool,
    pub enforcement: Enforcement,
    pub reason: Option<String>,
}

/// Deterministic sampling bucket in `[1, 100]`, derived from the first 16
/// bits of `SHA-256(header_from)` interpreted as a big-endian unsigned
/// integer, per spec.md §4.7 and §9 open question 4 (the reference
/// prototype buckets per-domain, not per-message, and this crate
/// preserves that for compatibility).
pub fn sampling_bucket(header_from: &str) -> u8 {
    let digest = Sha256::digest(header_from.as_bytes());
    let first16 = u16::from_be_bytes([digest[0], digest[1]]);
    ((first16 as u32) % 100 + 1) as u8
}

fn enforcement_for(policy: &DmarcPolicy, header_from: &str, dmarc_pass: bool) -> Enforcement {
    if dmarc_pass {
        return Enforcement::Allow;
    }
    let bucket = sampling_bucket(header_from);
    if bucket > policy.pct {
        return Enforcement::AllowPctSampling;
    }
    let operative = if policy.location != header_from {
        policy.sp.unwrap_or(policy.p)
    } else {
        policy.p
    };
    match operative {
        PolicyValue::None => Enforcement::AllowMonitoring,
        PolicyValue::Quarantine => Enforcement::Quarantine,
        PolicyValue::Reject => Enforcement::Reject,
    }
}

/// Runs a full DMARC evaluation, per spec.md §4.7.
pub async fn evaluate(
    header_from: &str,
    spf_result_is_pass: bool,
    spf_domain: Option<&str>,
    dkim_result_is_pass: bool,
    dkim_domain: Option<&str>,
    dns: &DnsClient,
) -> DmarcEvaluation {
    let located = locate(header_from, dns).await;

    let (location, record) = match located {
        Located::None => {
            return DmarcEvaluation {
                present: false,
                result: DmarcResult::None,
                policy: None,
                spf_aligned: false,
                dkim_aligned: false,
                enforcement: Enforcement::Allow,
                reason: Some("no DMARC record".to_string()),
            }
        }
        Located::PermError(reason) => {
            return DmarcEvaluation {
                present: true,
                result: DmarcResult::PermError(reason.clone()),
                policy: None,
                spf_aligned: false,
                dkim_aligned: false,
                enforcement: Enforcement::Allow,
                reason: Some(reason),
            }
        }
        Located::TempError(reason) => {
            return DmarcEvaluation {
                present: false,
                result: DmarcResult::TempError(reason.clone()),
                policy: None,
                spf_aligned: false,
                dkim_aligned: false,
                enforcement: Enforcement::Allow,
                reason: Some(reason),
            }
        }
        Located::Found { location, record } => (location, record),
    };

    let policy = parse_policy(&record, &location);

    let spf_aligned = spf_result_is_pass && aligned(spf_domain, header_from, policy.aspf);
    let dkim_aligned = dkim_result_is_pass && aligned(dkim_domain, header_from, policy.adkim);
    let dmarc_pass = spf_aligned || dkim_aligned;

    let enforcement = enforcement_for(&policy, header_from, dmarc_pass);

    DmarcEvaluation {
        present: true,
        result: if dmarc_pass {
            DmarcResult::Pass
        } else {
            DmarcResult::Fail
        },
        policy: Some(policy),
        spf_aligned,
        dkim_aligned,
        enforcement,
        reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsStatus, Resolver};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;

    #[derive(Default)]
    struct ScriptedResolver {
        txt: HashMap<String, Vec<String>>,
    }

    #[async_trait]
    impl Resolver for ScriptedResolver {
        async fn query_txt(&self, name: &str) -> (Vec<String>, DnsStatus, bool) {
            match self.txt.get(name) {
                Some(v) => (v.clone(), DnsStatus::Ok, false),
                None => (Vec::new(), DnsStatus::NxDomain, false),
            }
        }
        async fn query_a(&self, _name: &str) -> (Vec<Ipv4Addr>, DnsStatus, bool) {
            (Vec::new(), DnsStatus::NoData, false)
        }
        async fn query_aaaa(&self, _name: &str) -> (Vec<Ipv6Addr>, DnsStatus, bool) {
            (Vec::new(), DnsStatus::NoData, false)
        }
        async fn query_mx(&self, _name: &str) -> (Vec<String>, DnsStatus, bool) {
            (Vec::new(), DnsStatus::NoData, false)
        }
        async fn query_ptr(&self, _ip: IpAddr) -> (Vec<String>, DnsStatus, bool) {
            (Vec::new(), DnsStatus::NoData, false)
        }
    }

    fn dns_with(txt: HashMap<String, Vec<String>>) -> DnsClient {
        DnsClient::new(Arc::new(ScriptedResolver { txt }))
    }

    #[test]
    fn alignment_strict_requires_exact_match() {
        assert!(aligned(Some("example.com"), "example.com", AlignmentMode::Strict));
        assert!(!aligned(
            Some("mail.example.com"),
            "example.com",
            AlignmentMode::Strict
        ));
    }

    #[test]
    fn alignment_relaxed_allows_shared_org_domain() {
        assert!(aligned(
            Some("a.b.example.com"),
            "c.example.com",
            AlignmentMode::Relaxed
        ));
    }

    #[test]
    fn bucket_is_stable_and_in_range() {
        let b1 = sampling_bucket("example.com");
        let b2 = sampling_bucket("example.com");
        assert_eq!(b1, b2);
        assert!((1..=100).contains(&b1));
    }

    #[tokio::test]
    async fn s6_pass_when_spf_aligned() {
        let mut txt = HashMap::new();
        txt.insert(
            "_dmarc.example.com".to_string(),
            vec!["v=DMARC1; p=reject; sp=quarantine; aspf=r".to_string()],
        );
        let dns = dns_with(txt);
        let eval = evaluate(
            "mail.example.com",
            true,
            Some("mail.example.com"),
            false,
            None,
            &dns,
        )
        .await;
        assert_eq!(eval.result, DmarcResult::Pass);
        assert_eq!(eval.enforcement, Enforcement::Allow);
    }

    #[tokio::test]
    async fn s7_fail_uses_sp_from_org_domain_lookup() {
        let mut txt = HashMap::new();
        txt.insert(
            "_dmarc.example.com".to_string(),
            vec!["v=DMARC1; p=reject; sp=quarantine; pct=100".to_string()],
        );
        let dns = dns_with(txt);
        let eval = evaluate(
            "sub.example.com",
            false,
            None,
            false,
            None,
            &dns,
        )
        .await;
        assert_eq!(eval.result, DmarcResult::Fail);
        assert_eq!(eval.enforcement, Enforcement::Quarantine);
    }

    #[tokio::test]
    async fn s8_zero_pct_always_samples_out() {
        let mut txt = HashMap::new();
        txt.insert(
            "_dmarc.example.com".to_string(),
            vec!["v=DMARC1; p=reject; pct=0".to_string()],
        );
        let dns = dns_with(txt);
        let eval = evaluate("example.com", false, None, false, None, &dns).await;
        assert_eq!(eval.enforcement, Enforcement::AllowPctSampling);
    }

    #[tokio::test]
    async fn s9_multiple_records_is_permerror() {
        let mut txt = HashMap::new();
        txt.insert(
            "_dmarc.example.com".to_string(),
            vec![
                "v=DMARC1; p=reject".to_string(),
                "v=DMARC1; p=quarantine".to_string(),
            ],
        );
        let dns = dns_with(txt);
        let eval = evaluate("example.com", false, None, false, None, &dns).await;
        assert!(matches!(eval.result, DmarcResult::PermError(_)));
        assert_eq!(eval.enforcement, Enforcement::Allow);
    }

    #[tokio::test]
    async fn no_record_is_none_with_allow() {
        let dns = dns_with(HashMap::new());
        let eval = evaluate("example.com", true, Some("example.com"), false, None, &dns).await;
        assert_eq!(eval.result, DmarcResult::None);
        assert_eq!(eval.enforcement, Enforcement::Allow);
        assert!(!eval.present);
    }

    #[tokio::test]
    async fn falls_back_to_org_domain_record() {
        let mut txt = HashMap::new();
        txt.insert(
            "_dmarc.example.com".to_string(),
            vec!["v=DMARC1; p=reject".to_string()],
        );
        let dns = dns_with(txt);
        let eval = evaluate(
            "mail.sub.example.com",
            false,
            None,
            false,
            None,
            &dns,
        )
        .await;
        assert!(eval.present);
        assert_eq!(eval.policy.unwrap().location, "example.com");
    }
}
