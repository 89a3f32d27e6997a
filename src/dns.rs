/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! DNS Facade
//!
//! A typed resolver wrapper offering TXT, A, AAAA, MX and PTR queries with
//! UDP-then-TCP fallback and a request-scoped memoization cache. Every
//! lookup performed by the SPF evaluator and the DMARC evaluator goes
//! through a [`DnsClient`], so that caching and the eventual lookup-budget
//! accounting (owned by the caller, since the cost of a lookup is a
//! property of the SPF mechanism that triggered it, not of the DNS query
//! itself) stay consistent across one evaluation.
//!
//! This module never holds state across requests: a [`DnsClient`] is
//! created fresh per top-level check and discarded at the end, matching
//! the `EvalState` lifecycle in the specification's data model.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Per-query timeout for a single UDP or TCP attempt.
pub const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(2);
/// Overall budget for one logical lookup, including any TCP retry.
pub const DNS_LOOKUP_BUDGET: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Txt,
    A,
    Aaaa,
    Mx,
    Ptr,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Txt => "TXT",
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Mx => "MX",
            RecordType::Ptr => "PTR",
        }
    }
}

/// Outcome of a DNS query, distinguishing "the name exists but has no
/// records of this type" from "the name does not exist at all" from a
/// transient failure (timeout, SERVFAIL, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsStatus {
    Ok,
    NoData,
    NxDomain,
    Transient,
}

/// Result of one DNS lookup as seen by a caller: the ordered records, the
/// status, and bookkeeping about how the answer was obtained.
#[derive(Debug, Clone)]
pub struct DnsAnswer<T> {
    pub records: Vec<T>,
    pub status: DnsStatus,
    pub via_tcp: bool,
    pub cached: bool,
}

impl<T> DnsAnswer<T> {
    fn fresh(records: Vec<T>, status: DnsStatus, via_tcp: bool) -> Self {
        Self {
            records,
            status,
            via_tcp,
            cached: false,
        }
    }
}

/// Normalizes a DNS name the way every component of this crate expects:
/// lowercased, with any trailing root dot stripped.
pub fn normalize_domain(name: &str) -> String {
    let trimmed = name.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
    trimmed.to_ascii_lowercase()
}

/// Backend abstraction over the actual DNS transport, so tests can supply
/// scripted answers instead of hitting the network.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn query_txt(&self, name: &str) -> (Vec<String>, DnsStatus, bool);
    async fn query_a(&self, name: &str) -> (Vec<Ipv4Addr>, DnsStatus, bool);
    async fn query_aaaa(&self, name: &str) -> (Vec<Ipv6Addr>, DnsStatus, bool);
    async fn query_mx(&self, name: &str) -> (Vec<String>, DnsStatus, bool);
    async fn query_ptr(&self, ip: IpAddr) -> (Vec<String>, DnsStatus, bool);
}

/// Untyped cache payload. Kept as an enum (rather than one `HashMap` per
/// record type) so a single request-scoped cache instance can serve every
/// query kind behind one lock.
#[derive(Debug, Clone)]
enum CachedRecords {
    Txt(Vec<String>, DnsStatus, bool),
    A(Vec<Ipv4Addr>, DnsStatus, bool),
    Aaaa(Vec<Ipv6Addr>, DnsStatus, bool),
    Mx(Vec<String>, DnsStatus, bool),
    Ptr(Vec<String>, DnsStatus, bool),
}

/// Request-scoped memoization cache keyed by `(record type, normalized
/// name)`. Never shared across requests or evicted — its lifetime is a
/// single top-level evaluation.
#[derive(Default)]
pub struct DnsCache {
    entries: RwLock<HashMap<(RecordType, String), CachedRecords>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a previous lookup for this key is already memoized. Used by
    /// callers that need to know, ahead of dispatching, whether the
    /// lookup-budget counter should be charged.
    pub fn contains(&self, rtype: RecordType, name: &str) -> bool {
        self.entries
            .read()
            .contains_key(&(rtype, normalize_domain(name)))
    }
}

/// The DNS facade itself: a resolver backend plus its request-scoped cache.
#[derive(Clone)]
pub struct DnsClient {
    resolver: Arc<dyn Resolver>,
    cache: Arc<DnsCache>,
}

impl DnsClient {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            cache: Arc::new(DnsCache::new()),
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    pub async fn lookup_txt(&self, name: &str) -> DnsAnswer<String> {
        let key = (RecordType::Txt, normalize_domain(name));
        if let Some(CachedRecords::Txt(records, status, via_tcp)) =
            self.cache.entries.read().get(&key).cloned()
        {
            return DnsAnswer {
                records,
                status,
                via_tcp,
                cached: true,
            };
        }
        let (records, status, via_tcp) = self.dispatch(self.resolver.query_txt(&key.1)).await;
        self.cache.entries.write().insert(
            key,
            CachedRecords::Txt(records.clone(), status, via_tcp),
        );
        DnsAnswer::fresh(records, status, via_tcp)
    }

    pub async fn lookup_a(&self, name: &str) -> DnsAnswer<Ipv4Addr> {
        let key = (RecordType::A, normalize_domain(name));
        if let Some(CachedRecords::A(records, status, via_tcp)) =
            self.cache.entries.read().get(&key).cloned()
        {
            return DnsAnswer {
                records,
                status,
                via_tcp,
                cached: true,
            };
        }
        let (records, status, via_tcp) = self.dispatch(self.resolver.query_a(&key.1)).await;
        self.cache
            .entries
            .write()
            .insert(key, CachedRecords::A(records.clone(), status, via_tcp));
        DnsAnswer::fresh(records, status, via_tcp)
    }

    pub async fn lookup_aaaa(&self, name: &str) -> DnsAnswer<Ipv6Addr> {
        let key = (RecordType::Aaaa, normalize_domain(name));
        if let Some(CachedRecords::Aaaa(records, status, via_tcp)) =
            self.cache.entries.read().get(&key).cloned()
        {
            return DnsAnswer {
                records,
                status,
                via_tcp,
                cached: true,
            };
        }
        let (records, status, via_tcp) = self.dispatch(self.resolver.query_aaaa(&key.1)).await;
        self.cache
            .entries
            .write()
            .insert(key, CachedRecords::Aaaa(records.clone(), status, via_tcp));
        DnsAnswer::fresh(records, status, via_tcp)
    }

    pub async fn lookup_mx(&self, name: &str) -> DnsAnswer<String> {
        let key = (RecordType::Mx, normalize_domain(name));
        if let Some(CachedRecords::Mx(records, status, via_tcp)) =
            self.cache.entries.read().get(&key).cloned()
        {
            return DnsAnswer {
                records,
                status,
                via_tcp,
                cached: true,
            };
        }
        let (records, status, via_tcp) = self.dispatch(self.resolver.query_mx(&key.1)).await;
        self.cache
            .entries
            .write()
            .insert(key, CachedRecords::Mx(records.clone(), status, via_tcp));
        DnsAnswer::fresh(records, status, via_tcp)
    }

    pub async fn lookup_ptr(&self, ip: IpAddr) -> DnsAnswer<String> {
        let key = (RecordType::Ptr, ip.to_string());
        if let Some(CachedRecords::Ptr(records, status, via_tcp)) =
            self.cache.entries.read().get(&key).cloned()
        {
            return DnsAnswer {
                records,
                status,
                via_tcp,
                cached: true,
            };
        }
        let (records, status, via_tcp) = self.dispatch(self.resolver.query_ptr(ip)).await;
        self.cache
            .entries
            .write()
            .insert(key, CachedRecords::Ptr(records.clone(), status, via_tcp));
        DnsAnswer::fresh(records, status, via_tcp)
    }

    async fn dispatch<T, F>(&self, fut: F) -> (Vec<T>, DnsStatus, bool)
    where
        F: std::future::Future<Output = (Vec<T>, DnsStatus, bool)>,
    {
        match tokio::time::timeout(DNS_LOOKUP_BUDGET, fut).await {
            Ok(answer) => answer,
            Err(_) => (Vec::new(), DnsStatus::Transient, false),
        }
    }
}

/// Production resolver backed by `hickory-resolver`. Maintains two
/// pre-configured resolver instances — one restricted to UDP, one to TCP —
/// and falls back to the TCP instance whenever the UDP attempt fails for
/// any reason (timeout, truncation, SERVFAIL), recording that fact so the
/// caller can surface it in its trace.
pub struct HickoryResolver {
    udp: hickory_resolver::TokioAsyncResolver,
    tcp: hickory_resolver::TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn from_system_conf() -> Result<Self, crate::error::DnsError> {
        use hickory_resolver::config::{ResolverConfig, ResolverOpts};

        let mut opts = ResolverOpts::default();
        opts.timeout = DNS_QUERY_TIMEOUT;
        opts.attempts = 1;

        let (config, _) =
            hickory_resolver::system_conf::read_system_conf().map_err(|e| {
                crate::error::DnsError::Configuration {
                    reason: e.to_string(),
                }
            })?;

        Self::with_config(config, opts)
    }

    pub fn with_config(
        base: hickory_resolver::config::ResolverConfig,
        mut opts: hickory_resolver::config::ResolverOpts,
    ) -> Result<Self, crate::error::DnsError> {
        use hickory_resolver::config::Protocol;

        opts.timeout = DNS_QUERY_TIMEOUT;

        let udp_config = rebuild_with_protocol(&base, Protocol::Udp);
        let tcp_config = rebuild_with_protocol(&base, Protocol::Tcp);

        Ok(Self {
            udp: hickory_resolver::TokioAsyncResolver::tokio(udp_config, opts.clone()),
            tcp: hickory_resolver::TokioAsyncResolver::tokio(tcp_config, opts),
        })
    }

    fn classify(err: &hickory_resolver::error::ResolveError) -> DnsStatus {
        use hickory_resolver::error::ResolveErrorKind;
        use hickory_resolver::proto::op::ResponseCode;

        match err.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                if *response_code == ResponseCode::NXDomain {
                    DnsStatus::NxDomain
                } else {
                    DnsStatus::NoData
                }
            }
            ResolveErrorKind::Timeout => DnsStatus::Transient,
            _ => DnsStatus::Transient,
        }
    }
}

fn rebuild_with_protocol(
    base: &hickory_resolver::config::ResolverConfig,
    protocol: hickory_resolver::config::Protocol,
) -> hickory_resolver::config::ResolverConfig {
    use hickory_resolver::config::{NameServerConfig, ResolverConfig};

    let mut config = ResolverConfig::new();
    for ns in base.name_servers() {
        config.add_name_server(NameServerConfig {
            socket_addr: ns.socket_addr,
            protocol,
            tls_dns_name: ns.tls_dns_name.clone(),
            trust_negative_responses: ns.trust_negative_responses,
            tls_config: ns.tls_config.clone(),
            bind_addr: ns.bind_addr,
        });
    }
    config
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn query_txt(&self, name: &str) -> (Vec<String>, DnsStatus, bool) {
        match self.udp.txt_lookup(name).await {
            Ok(answer) => (
                answer
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|seg| String::from_utf8_lossy(seg).into_owned())
                            .collect::<String>()
                    })
                    .collect(),
                DnsStatus::Ok,
                false,
            ),
            Err(udp_err) => match self.tcp.txt_lookup(name).await {
                Ok(answer) => (
                    answer
                        .iter()
                        .map(|txt| {
                            txt.txt_data()
                                .iter()
                                .map(|seg| String::from_utf8_lossy(seg).into_owned())
                                .collect::<String>()
                        })
                        .collect(),
                    DnsStatus::Ok,
                    true,
                ),
                Err(_) => (Vec::new(), Self::classify(&udp_err), true),
            },
        }
    }

    async fn query_a(&self, name: &str) -> (Vec<Ipv4Addr>, DnsStatus, bool) {
        match self.udp.ipv4_lookup(name).await {
            Ok(answer) => (answer.iter().map(|a| a.0).collect(), DnsStatus::Ok, false),
            Err(udp_err) => match self.tcp.ipv4_lookup(name).await {
                Ok(answer) => (answer.iter().map(|a| a.0).collect(), DnsStatus::Ok, true),
                Err(_) => (Vec::new(), Self::classify(&udp_err), true),
            },
        }
    }

    async fn query_aaaa(&self, name: &str) -> (Vec<Ipv6Addr>, DnsStatus, bool) {
        match self.udp.ipv6_lookup(name).await {
            Ok(answer) => (answer.iter().map(|a| a.0).collect(), DnsStatus::Ok, false),
            Err(udp_err) => match self.tcp.ipv6_lookup(name).await {
                Ok(answer) => (answer.iter().map(|a| a.0).collect(), DnsStatus::Ok, true),
                Err(_) => (Vec::new(), Self::classify(&udp_err), true),
            },
        }
    }

    async fn query_mx(&self, name: &str) -> (Vec<String>, DnsStatus, bool) {
        match self.udp.mx_lookup(name).await {
            Ok(answer) => (
                answer
                    .iter()
                    .map(|mx| normalize_domain(&mx.exchange().to_utf8()))
                    .collect(),
                DnsStatus::Ok,
                false,
            ),
            Err(udp_err) => match self.tcp.mx_lookup(name).await {
                Ok(answer) => (
                    answer
                        .iter()
                        .map(|mx| normalize_domain(&mx.exchange().to_utf8()))
                        .collect(),
                    DnsStatus::Ok,
                    true,
                ),
                Err(_) => (Vec::new(), Self::classify(&udp_err), true),
            },
        }
    }

    async fn query_ptr(&self, ip: IpAddr) -> (Vec<String>, DnsStatus, bool) {
        match self.udp.reverse_lookup(ip).await {
            Ok(answer) => (
                answer.iter().map(|name| normalize_domain(&name.to_utf8())).collect(),
                DnsStatus::Ok,
                false,
            ),
            Err(udp_err) => match self.tcp.reverse_lookup(ip).await {
                Ok(answer) => (
                    answer.iter().map(|name| normalize_domain(&name.to_utf8())).collect(),
                    DnsStatus::Ok,
                    true,
                ),
                Err(_) => (Vec::new(), Self::classify(&udp_err), true),
            },
        }
    }
}
