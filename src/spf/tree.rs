/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Non-evaluating SPF record-graph walk.
//!
//! `evaluate_spf` answers "does this IP pass", short-circuiting on the
//! first match. A caller that instead wants to see the *shape* of a
//! domain's SPF graph — every domain an `include`/`redirect` chain would
//! touch and the raw record found at each — needs a second, simpler walk
//! that never stops early and never consults an IP. This mirrors
//! `spf_extractor.py::build_spf_tree` in the reference prototype; the
//! box-drawing presentation that prototype also produces is the excluded
//! front end's job; this module only exposes the underlying data.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use crate::dns::{normalize_domain, DnsClient};
use crate::spf::mechanism::{tokenize, MechanismKind, Modifier, Term};
use crate::spf::record::{fetch_spf, FetchedRecord};

/// One node of the SPF record graph rooted at some domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfRecordTree {
    pub domain: String,
    /// `None` when no SPF record was found or the domain was already
    /// visited (loop).
    pub record: Option<String>,
    /// A short status tag mirroring the reference prototype's inline
    /// markers: "NO-SPF", "LOOP-DETECTED", or a "PERMERROR: ..." string.
    pub status: Option<String>,
    /// The mechanism/modifier tokens found in `record`, verbatim.
    pub terms: Vec<String>,
    /// Child nodes reached via `include:` or `redirect=`, in record order.
    pub children: Vec<SpfRecordTree>,
}

/// Walks the `include`/`redirect` graph of `domain`, sharing one DNS
/// cache and one loop guard across the whole walk but never evaluating
/// against an IP.
pub fn build_spf_tree<'a>(
    domain: &'a str,
    dns: &'a DnsClient,
) -> Pin<Box<dyn Future<Output = SpfRecordTree> + Send + 'a>> {
    Box::pin(build(domain, dns, &mut HashSet::new()))
}

async fn build(domain: &str, dns: &DnsClient, seen: &mut HashSet<String>) -> SpfRecordTree {
    let domain = normalize_domain(domain);

    if seen.contains(&domain) {
        return SpfRecordTree {
            domain,
            record: None,
            status: Some("LOOP-DETECTED".to_string()),
            terms: Vec::new(),
            children: Vec::new(),
        };
    }
    seen.insert(domain.clone());

    let fetched = fetch_spf(&domain, dns).await;
    let body = match fetched {
        FetchedRecord::None => {
            return SpfRecordTree {
                domain,
                record: None,
                status: Some("NO-SPF".to_string()),
                terms: Vec::new(),
                children: Vec::new(),
            }
        }
        FetchedRecord::PermError(reason) => {
            return SpfRecordTree {
                domain,
                record: None,
                status: Some(format!("PERMERROR: {reason}")),
                terms: Vec::new(),
                children: Vec::new(),
            }
        }
        FetchedRecord::TempError(reason) => {
            return SpfRecordTree {
                domain,
                record: None,
                status: Some(format!("TEMPERROR: {reason}")),
                terms: Vec::new(),
                children: Vec::new(),
            }
        }
        FetchedRecord::Found(body) => body,
    };

    let record = format!("v=spf1 {body}");
    let parsed = tokenize(&body);
    let mut terms = Vec::with_capacity(parsed.len());
    let mut children = Vec::new();

    for term in &parsed {
        match term {
            Term::Mechanism(m) => {
                terms.push(m.raw.clone());
                match &m.kind {
                    MechanismKind::Include => {
                        if let Some(target) = &m.target {
                            children.push(Box::pin(build(target, dns, seen)).await);
                        }
                    }
                    _ => {}
                }
            }
            Term::Modifier(m) => {
                terms.push(m.raw.clone());
                if let Modifier::Redirect(target) = &m.modifier {
                    children.push(Box::pin(build(target, dns, seen)).await);
                }
            }
        }
    }

    SpfRecordTree {
        domain,
        record: Some(record),
        status: None,
        terms,
        children,
    }
}
