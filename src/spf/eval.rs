/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The SPF Evaluator: a recursive mechanism walker carrying an explicit,
//! request-scoped `state` (visited-domain set, lookup counter, DNS cache)
//! down through every `include`/`redirect` recursion, rather than reaching
//! for ambient or global state.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;

use ipnet::IpNet;

use crate::dns::{normalize_domain, DnsClient, RecordType};
use crate::spf::macros::{expand_macros, MacroEnv};
use crate::spf::mechanism::{Mechanism, MechanismKind, Modifier, Term};
use crate::spf::record::{fetch_spf, FetchedRecord};

pub const MAX_SPF_LOOKUPS: u32 = 10;
pub const MAX_RECURSION_DEPTH: u32 = 20;

/// Tagged SPF outcome. Kept as a sum type rather than a free-form string so
/// callers pattern-match instead of parsing text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError(String),
    PermError(String),
}

impl SpfResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, SpfResult::Pass)
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpfResult::Pass => write!(f, "PASS"),
            SpfResult::Fail => write!(f, "FAIL"),
            SpfResult::SoftFail => write!(f, "SOFTFAIL"),
            SpfResult::Neutral => write!(f, "NEUTRAL"),
            SpfResult::None => write!(f, "NONE"),
            SpfResult::TempError(reason) => write!(f, "TEMPERROR ({reason})"),
            SpfResult::PermError(reason) => write!(f, "PERMERROR ({reason})"),
        }
    }
}

/// Per-evaluation configuration. Defaults match the RFC 7208 limits this
/// spec pins.
#[derive(Debug, Clone)]
pub struct SpfConfig {
    pub max_lookups: u32,
    pub max_recursion_depth: u32,
    /// When set, an unknown mechanism name is logged and skipped instead of
    /// producing PERMERROR. Default `false` (strict).
    pub lenient_unknown_mechanisms: bool,
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            max_lookups: MAX_SPF_LOOKUPS,
            max_recursion_depth: MAX_RECURSION_DEPTH,
            lenient_unknown_mechanisms: false,
        }
    }
}

/// State threaded explicitly through the recursion tree of one top-level
/// SPF evaluation: the visited-domain set (loop detection), the
/// lookup-budget counter, the shared DNS cache, and the accumulated trace.
pub struct EvalState {
    visited: HashSet<String>,
    lookups: u32,
    dns: DnsClient,
    trace: Vec<String>,
}

impl EvalState {
    pub fn new(dns: DnsClient) -> Self {
        Self {
            visited: HashSet::new(),
            lookups: 0,
            dns,
            trace: Vec::new(),
        }
    }

    pub fn lookups(&self) -> u32 {
        self.lookups
    }

    pub fn into_trace(self) -> Vec<String> {
        self.trace
    }
}

fn log(state: &mut EvalState, line: impl Into<String>) {
    state.trace.push(line.into());
}

/// Charges the lookup budget exactly once for this mechanism term, only if
/// the underlying record is not already cached — cache hits are free, and
/// a term that requires several underlying DNS sub-queries (e.g. `a`
/// resolving A *and* AAAA) is still only charged once.
async fn charge(
    state: &mut EvalState,
    config: &SpfConfig,
    rtype: RecordType,
    key: &str,
) -> Result<(), SpfResult> {
    if !state.dns.cache().contains(rtype, key) {
        state.lookups += 1;
        if state.lookups > config.max_lookups {
            return Err(SpfResult::PermError("too many DNS lookups".to_string()));
        }
    }
    Ok(())
}

async fn resolve_a_aaaa(state: &mut EvalState, target: &str) -> (Vec<Ipv4Addr>, Vec<Ipv6Addr>) {
    let a = state.dns.lookup_a(target).await;
    log_answer(state, RecordType::A, target, a.cached, a.via_tcp);
    let v4 = a.records;

    let aaaa = state.dns.lookup_aaaa(target).await;
    log_answer(state, RecordType::Aaaa, target, aaaa.cached, aaaa.via_tcp);
    let v6 = aaaa.records;

    (v4, v6)
}

fn log_answer(state: &mut EvalState, rtype: RecordType, name: &str, cached: bool, via_tcp: bool) {
    if cached {
        log(state, format!("DNS cache hit: {} {name}", rtype.as_str()));
    } else {
        log(state, format!("DNS lookup: {} {name}", rtype.as_str()));
        if via_tcp {
            log(
                state,
                format!("DNS lookup (TCP fallback): {} {name}", rtype.as_str()),
            );
        }
    }
}

fn ip_matches(candidate: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match IpNet::new(candidate, prefix) {
        Ok(net) => net.contains(&ip),
        Err(_) => false,
    }
}

enum Outcome {
    Matched(SpfResult),
    Continue,
}

/// Walks the `include`/`redirect` graph of `domain` looking for a path to
/// `ip`, consuming the shared lookup budget and loop guard in `state`.
///
/// Recursive by construction (`include:`/`redirect=` re-enter this
/// function one level deeper); the indirection through `Box::pin` is
/// required because an `async fn` cannot otherwise call itself — its
/// future would have unbounded size.
pub fn evaluate_spf<'a>(
    domain: &'a str,
    ip: IpAddr,
    state: &'a mut EvalState,
    depth: u32,
    mail_from: &'a str,
    helo: &'a str,
    config: &'a SpfConfig,
) -> Pin<Box<dyn Future<Output = SpfResult> + Send + 'a>> {
    Box::pin(async move {
        if depth > config.max_recursion_depth {
            return SpfResult::PermError("recursion depth exceeded".to_string());
        }

        let domain = normalize_domain(domain);
        if state.visited.contains(&domain) {
            return SpfResult::PermError("DNS loop detected".to_string());
        }
        state.visited.insert(domain.clone());
        log(state, format!("Evaluating SPF for domain: {domain}"));

        let env = build_macro_env(mail_from, helo, ip, &domain);

        let record = fetch_spf(&domain, &state.dns).await;
        let body = match record {
            FetchedRecord::None => return SpfResult::None,
            FetchedRecord::PermError(reason) => return SpfResult::PermError(reason),
            FetchedRecord::TempError(reason) => return SpfResult::TempError(reason),
            FetchedRecord::Found(body) => body,
        };
        log(state, format!("SPF record: v=spf1 {body}"));

        let terms = crate::spf::mechanism::tokenize(&body);

        let mut redirect_target: Option<String> = None;
        let mut exp_target: Option<String> = None;

        for term in &terms {
            let raw = match term {
                Term::Mechanism(m) => m.raw.as_str(),
                Term::Modifier(m) => m.raw.as_str(),
            };
            log(state, format!("Checking mechanism: {raw}"));

            match term {
                Term::Modifier(m) => match &m.modifier {
                    Modifier::Redirect(target) => {
                        let expanded_domain = normalize_domain(&expand_macros(target, &env));
                        if let Err(err) = charge(state, config, RecordType::Txt, &expanded_domain).await
                        {
                            return err;
                        }
                        redirect_target = Some(expanded_domain);
                    }
                    Modifier::Exp(target) => {
                        exp_target = Some(normalize_domain(&expand_macros(target, &env)));
                    }
                    Modifier::Unknown { .. } => {}
                },
                Term::Mechanism(mechanism) => {
                    let outcome = dispatch_mechanism(
                        mechanism,
                        &domain,
                        ip,
                        state,
                        &env,
                        config,
                        &exp_target,
                        mail_from,
                        helo,
                        depth,
                    )
                    .await;
                    match outcome {
                        Outcome::Matched(result) => return result,
                        Outcome::Continue => {}
                    }
                }
            }
        }

        if let Some(target) = redirect_target {
            log(state, format!("Redirecting to: {target}"));
            let result =
                evaluate_spf(&target, ip, state, depth + 1, mail_from, helo, config).await;
            return match result {
                SpfResult::None => SpfResult::PermError(format!(
                    "redirect target {target} has no SPF record"
                )),
                other => other,
            };
        }

        SpfResult::Neutral
    })
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_mechanism(
    mechanism: &Mechanism,
    domain: &str,
    ip: IpAddr,
    state: &mut EvalState,
    env: &MacroEnv,
    config: &SpfConfig,
    exp_target: &Option<String>,
    mail_from: &str,
    helo: &str,
    depth: u32,
) -> Outcome {
    let default_target = || domain.to_string();
    let expanded_target = |raw: &str| normalize_domain(&expand_macros(raw, env));

    match &mechanism.kind {
        MechanismKind::All => {
            let result = mechanism.qualifier.as_result();
            if result == SpfResult::Fail {
                if let Some(exp_domain) = exp_target {
                    let answer = state.dns.lookup_txt(exp_domain).await;
                    log_answer(state, RecordType::Txt, exp_domain, answer.cached, answer.via_tcp);
                    if let Some(first) = answer.records.first() {
                        let explanation = expand_macros(first, env);
                        log(state, format!("Explanation: {explanation}"));
                    }
                }
            }
            Outcome::Matched(result)
        }

        MechanismKind::Ip4 | MechanismKind::Ip6 => {
            let Some(target) = &mechanism.target else {
                return Outcome::Matched(SpfResult::PermError(
                    "ip4/ip6 mechanism missing address".to_string(),
                ));
            };
            let Ok(addr) = target.parse::<IpAddr>() else {
                return Outcome::Matched(SpfResult::PermError(format!(
                    "invalid ip mechanism target: {target}"
                )));
            };
            let default_prefix = if addr.is_ipv4() { 32 } else { 128 };
            let prefix = mechanism.single_prefix().unwrap_or(default_prefix);
            if ip_matches(addr, prefix, ip) {
                Outcome::Matched(mechanism.qualifier.as_result())
            } else {
                Outcome::Continue
            }
        }

        MechanismKind::A => {
            let target = mechanism
                .target
                .as_ref()
                .map(|t| expanded_target(t))
                .unwrap_or_else(default_target);
            if let Err(err) = charge(state, config, RecordType::A, &target).await {
                return Outcome::Matched(err);
            }
            let (v4, v6) = resolve_a_aaaa(state, &target).await;
            let (p4, p6) = mechanism.dual_prefix();
            if v4
                .iter()
                .any(|a| ip_matches(IpAddr::V4(*a), p4.unwrap_or(32), ip))
                || v6
                    .iter()
                    .any(|a| ip_matches(IpAddr::V6(*a), p6.unwrap_or(128), ip))
            {
                Outcome::Matched(mechanism.qualifier.as_result())
            } else {
                Outcome::Continue
            }
        }

        MechanismKind::Mx => {
            let target = mechanism
                .target
                .as_ref()
                .map(|t| expanded_target(t))
                .unwrap_or_else(default_target);
            if let Err(err) = charge(state, config, RecordType::Mx, &target).await {
                return Outcome::Matched(err);
            }
            let mx_answer = state.dns.lookup_mx(&target).await;
            log_answer(state, RecordType::Mx, &target, mx_answer.cached, mx_answer.via_tcp);
            if mx_answer.records.len() > 10 {
                return Outcome::Matched(SpfResult::PermError(format!(
                    "mx mechanism for {target} resolved more than 10 hosts"
                )));
            }
            let (p4, p6) = mechanism.dual_prefix();
            for host in &mx_answer.records {
                let (v4, v6) = resolve_a_aaaa(state, host).await;
                if v4
                    .iter()
                    .any(|a| ip_matches(IpAddr::V4(*a), p4.unwrap_or(32), ip))
                    || v6
                        .iter()
                        .any(|a| ip_matches(IpAddr::V6(*a), p6.unwrap_or(128), ip))
                {
                    return Outcome::Matched(mechanism.qualifier.as_result());
                }
            }
            Outcome::Continue
        }

        MechanismKind::Include => {
            let Some(raw_target) = &mechanism.target else {
                return Outcome::Matched(SpfResult::PermError(
                    "include mechanism missing target".to_string(),
                ));
            };
            let target = expanded_target(raw_target);
            if let Err(err) = charge(state, config, RecordType::Txt, &target).await {
                return Outcome::Matched(err);
            }
            let result =
                evaluate_spf(&target, ip, state, depth + 1, mail_from, helo, config).await;
            match result {
                SpfResult::Pass => Outcome::Matched(mechanism.qualifier.as_result()),
                SpfResult::PermError(_) | SpfResult::TempError(_) => Outcome::Matched(result),
                SpfResult::None => Outcome::Matched(SpfResult::PermError(format!(
                    "include target {target} has no SPF record"
                ))),
                SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => Outcome::Continue,
            }
        }

        MechanismKind::Exists => {
            let Some(raw_target) = &mechanism.target else {
                return Outcome::Matched(SpfResult::PermError(
                    "exists mechanism missing target".to_string(),
                ));
            };
            let target = expanded_target(raw_target);
            if let Err(err) = charge(state, config, RecordType::A, &target).await {
                return Outcome::Matched(err);
            }
            log(state, format!("EXISTS check: {target}"));
            let answer = state.dns.lookup_a(&target).await;
            log_answer(state, RecordType::A, &target, answer.cached, answer.via_tcp);
            if !answer.records.is_empty() {
                Outcome::Matched(mechanism.qualifier.as_result())
            } else {
                Outcome::Continue
            }
        }

        MechanismKind::Ptr => {
            if let Err(err) = charge(state, config, RecordType::Ptr, &ip.to_string()).await {
                return Outcome::Matched(err);
            }
            let target_domain = mechanism
                .target
                .as_ref()
                .map(|t| expanded_target(t))
                .unwrap_or_else(default_target);
            let ptr_answer = state.dns.lookup_ptr(ip).await;
            log_answer(
                state,
                RecordType::Ptr,
                &ip.to_string(),
                ptr_answer.cached,
                ptr_answer.via_tcp,
            );
            for name in &ptr_answer.records {
                let suffix = format!(".{target_domain}");
                if *name != target_domain && !name.ends_with(&suffix) {
                    continue;
                }
                let (v4, v6) = resolve_a_aaaa(state, name).await;
                let found = v4.iter().any(|a| IpAddr::V4(*a) == ip)
                    || v6.iter().any(|a| IpAddr::V6(*a) == ip);
                if found {
                    return Outcome::Matched(mechanism.qualifier.as_result());
                }
            }
            Outcome::Continue
        }

        MechanismKind::Unknown(name) => {
            if config.lenient_unknown_mechanisms {
                log(state, format!("Unknown mechanism ignored: {}", mechanism.raw));
                Outcome::Continue
            } else {
                Outcome::Matched(SpfResult::PermError(format!(
                    "unknown SPF mechanism: {name}"
                )))
            }
        }
    }
}

fn build_macro_env(mail_from: &str, helo: &str, ip: IpAddr, domain: &str) -> MacroEnv {
    let (local, sender_domain) = split_mail_from(mail_from);
    MacroEnv {
        s: mail_from.to_string(),
        l: local,
        o: sender_domain,
        d: domain.to_string(),
        h: helo.to_string(),
        r: domain.to_string(),
        t: crate::time::unix_timestamp().to_string(),
        ip,
    }
}

fn split_mail_from(mail_from: &str) -> (String, String) {
    if mail_from.is_empty() || mail_from == "<>" {
        return (String::new(), String::new());
    }
    let trimmed = mail_from.trim_matches(|c| c == '<' || c == '>');
    match trimmed.split_once('@') {
        Some((local, domain)) => (local.to_string(), normalize_domain(domain)),
        None => (trimmed.to_string(), String::new()),
    }
}

/// Runs a fresh top-level SPF evaluation and returns the result alongside
/// its human-readable trace.
pub async fn run(
    domain: &str,
    ip: IpAddr,
    mail_from: &str,
    helo: &str,
    dns: DnsClient,
    config: &SpfConfig,
) -> (SpfResult, Vec<String>) {
    let mut state = EvalState::new(dns);
    let result = evaluate_spf(domain, ip, &mut state, 0, mail_from, helo, config).await;
    (result, state.into_trace())
}
