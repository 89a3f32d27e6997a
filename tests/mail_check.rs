/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! End-to-end checks against the full orchestrator, using a scripted DNS
//! backend instead of the network. These exercise the scenarios in
//! spec.md §8's concrete-scenarios table across component boundaries,
//! where the per-module unit tests only exercise one component.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use mailauth_check::dkim::{DkimResult, DkimVerifier};
use mailauth_check::dns::{DnsClient, DnsStatus, Resolver};
use mailauth_check::orchestrator::{CheckRequest, EngineConfig};

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

struct AlwaysPassDkim;
#[async_trait]
impl DkimVerifier for AlwaysPassDkim {
    async fn verify(&self, _raw_message: &[u8]) -> DkimResult {
        DkimResult::Pass
    }
}

fn dns_with(txt: HashMap<String, Vec<String>>) -> DnsClient {
    DnsClient::new(Arc::new(ScriptedResolver { txt }))
}

#[tokio::test]
async fn spf_and_dmarc_pass_without_raw_message() {
    let mut txt = HashMap::new();
    txt.insert(
        "example.com".to_string(),
        vec!["v=spf1 ip4:192.0.2.0/24 -all".to_string()],
    );
    txt.insert(
        "_dmarc.example.com".to_string(),
        vec!["v=DMARC1; p=reject; aspf=r".to_string()],
    );

    let request = CheckRequest::new(
        "example.com",
        "192.0.2.5",
        Some("sender@example.com".to_string()),
        None,
        None,
    )
    .unwrap();

    let verdict = mailauth_check::orchestrator::run_check(
        &request,
        dns_with(txt),
        &AlwaysPassDkim,
        &EngineConfig::default(),
    )
    .await;

    assert_eq!(verdict.spf.result, "PASS");
    assert_eq!(verdict.dmarc.result, "PASS");
    assert_eq!(verdict.dmarc.enforcement, "ALLOW");
    assert!(!verdict.dkim.performed);
}

#[tokio::test]
async fn s10_dkim_alignment_makes_dmarc_pass_via_raw_message() {
    let mut txt = HashMap::new();
    // No SPF record at all: SPF is NONE, not aligned, so DMARC must rely
    // entirely on DKIM alignment to pass.
    txt.insert(
        "_dmarc.example.com".to_string(),
        vec!["v=DMARC1; p=reject; adkim=r".to_string()],
    );

    let raw = b"From: Alice <alice@example.com>\r\n\
DKIM-Signature: v=1; a=rsa-sha256; d=mail.example.com; s=selector1; c=relaxed/relaxed\r\n\
\r\n\
Hello there.";

    let request = CheckRequest::new(
        "example.com",
        "192.0.2.5",
        None,
        None,
        Some(raw.to_vec()),
    )
    .unwrap();

    let verdict = mailauth_check::orchestrator::run_check(
        &request,
        dns_with(txt),
        &AlwaysPassDkim,
        &EngineConfig::default(),
    )
    .await;

    assert_eq!(verdict.spf.result, "NONE");
    assert_eq!(verdict.dkim.result, "PASS");
    assert_eq!(verdict.dkim.domain.as_deref(), Some("mail.example.com"));
    assert_eq!(verdict.dmarc.result, "PASS");
    assert!(verdict.dmarc.dkim_aligned);
    assert!(!verdict.dmarc.spf_aligned);
}

#[tokio::test]
async fn no_dmarc_record_yields_allow_with_none_result() {
    let mut txt = HashMap::new();
    txt.insert(
        "example.com".to_string(),
        vec!["v=spf1 -all".to_string()],
    );

    let request =
        CheckRequest::new("example.com", "198.51.100.9", None, None, None).unwrap();

    let verdict = mailauth_check::orchestrator::run_check(
        &request,
        dns_with(txt),
        &AlwaysPassDkim,
        &EngineConfig::default(),
    )
    .await;

    assert_eq!(verdict.spf.result, "FAIL");
    assert_eq!(verdict.dmarc.result, "NONE");
    assert_eq!(verdict.dmarc.enforcement, "ALLOW");
}

#[tokio::test]
async fn mail_from_domain_drives_spf_but_not_dmarc_header_from() {
    let mut txt = HashMap::new();
    txt.insert(
        "sending.example.net".to_string(),
        vec!["v=spf1 ip4:203.0.113.0/24 -all".to_string()],
    );
    txt.insert(
        "_dmarc.example.com".to_string(),
        vec!["v=DMARC1; p=reject; aspf=r".to_string()],
    );

    let raw = b"From: Alice <alice@example.com>\r\n\r\nbody";

    let request = CheckRequest::new(
        "example.com",
        "203.0.113.7",
        Some("bounce@sending.example.net".to_string()),
        None,
        Some(raw.to_vec()),
    )
    .unwrap();

    let verdict = mailauth_check::orchestrator::run_check(
        &request,
        dns_with(txt),
        &AlwaysPassDkim,
        &EngineConfig::default(),
    )
    .await;

    assert_eq!(verdict.spf.domain, "sending.example.net");
    assert_eq!(verdict.spf.result, "PASS");
    // spf_domain (sending.example.net) does not align (even under relaxed
    // mode) with header-from (example.com), so DMARC must fail despite
    // the underlying SPF PASS.
    assert_eq!(verdict.dmarc.result, "FAIL");
    assert!(!verdict.dmarc.spf_aligned);
}
