/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! SPF Record Source — fetches a domain's SPF TXT record and applies the
//! validation rules that turn a set of TXT answers into exactly one
//! record, `NONE`, or a permanent/transient error.

use crate::dns::{DnsClient, DnsStatus};

/// Outcome of fetching a domain's SPF record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedRecord {
    /// Exactly one valid `v=spf1` record was found; this is the mechanism
    /// text *after* the `v=spf1` marker.
    Found(String),
    /// No TXT record begins with `v=spf1`.
    None,
    PermError(String),
    TempError(String),
}

fn strip_quotes(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

fn has_forbidden_control_byte(s: &str) -> bool {
    s.bytes()
        .any(|b| b < 0x20 && b != b'\t' && b != b'\r' && b != b'\n')
}

fn is_spf_version_record(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower == "v=spf1"
        || lower
            .strip_prefix("v=spf1")
            .map(|rest| rest.starts_with(char::is_whitespace))
            .unwrap_or(false)
}

pub async fn fetch_spf(domain: &str, dns: &DnsClient) -> FetchedRecord {
    let answer = dns.lookup_txt(domain).await;

    match answer.status {
        DnsStatus::Transient => {
            return FetchedRecord::TempError(format!("DNS transient failure for {domain}"))
        }
        DnsStatus::NxDomain | DnsStatus::NoData => return FetchedRecord::None,
        DnsStatus::Ok => {}
    }

    let candidates: Vec<&str> = answer
        .records
        .iter()
        .map(|rec| strip_quotes(rec.trim()))
        .filter(|rec| is_spf_version_record(rec))
        .collect();

    if candidates.iter().any(|rec| has_forbidden_control_byte(rec)) {
        return FetchedRecord::PermError(format!("malformed SPF record at {domain}"));
    }

    match candidates.len() {
        0 => FetchedRecord::None,
        1 => {
            let body = candidates[0]
                .get(6..)
                .unwrap_or("")
                .trim_start()
                .to_string();
            FetchedRecord::Found(body)
        }
        _ => FetchedRecord::PermError(format!("multiple SPF records at {domain}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsAnswer, RecordType, Resolver};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;

    struct ScriptedResolver {
        txt: HashMap<String, Vec<String>>,
    }

    #[async_trait]
    impl Resolver for ScriptedResolver {
        async fn query_txt(&self, name: &str) -> (Vec<String>, DnsStatus, bool) {
            match self.txt.get(name) {
                Some(records) => (records.clone(), DnsStatus::Ok, false),
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

    fn client(txt: HashMap<String, Vec<String>>) -> DnsClient {
        DnsClient::new(Arc::new(ScriptedResolver { txt }))
    }

    #[tokio::test]
    async fn no_txt_is_none() {
        let c = client(HashMap::new());
        assert_eq!(fetch_spf("example.com", &c).await, FetchedRecord::None);
    }

    #[tokio::test]
    async fn single_record_found() {
        let mut txt = HashMap::new();
        txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 ip4:192.0.2.0/24 -all".to_string()],
        );
        let c = client(txt);
        assert_eq!(
            fetch_spf("example.com", &c).await,
            FetchedRecord::Found("ip4:192.0.2.0/24 -all".to_string())
        );
    }

    #[tokio::test]
    async fn unrelated_txt_records_are_ignored() {
        let mut txt = HashMap::new();
        txt.insert(
            "example.com".to_string(),
            vec![
                "google-site-verification=abc".to_string(),
                "v=spf1 -all".to_string(),
            ],
        );
        let c = client(txt);
        assert_eq!(
            fetch_spf("example.com", &c).await,
            FetchedRecord::Found("-all".to_string())
        );
    }

    #[tokio::test]
    async fn two_spf_records_is_permerror() {
        let mut txt = HashMap::new();
        txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 -all".to_string(), "v=spf1 ~all".to_string()],
        );
        let c = client(txt);
        assert!(matches!(
            fetch_spf("example.com", &c).await,
            FetchedRecord::PermError(_)
        ));
    }

    #[tokio::test]
    async fn control_byte_is_permerror() {
        let mut txt = HashMap::new();
        txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 -all\x07".to_string()],
        );
        let c = client(txt);
        assert!(matches!(
            fetch_spf("example.com", &c).await,
            FetchedRecord::PermError(_)
        ));
    }

    #[test]
    fn record_type_used_for_cache_key() {
        assert_eq!(RecordType::Txt.as_str(), "TXT");
    }
}
