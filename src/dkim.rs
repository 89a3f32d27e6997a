/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! DKIM Signature Inventory and Verifier Adapter.
//!
//! This module never performs cryptographic verification itself — that
//! oracle is a black-box external collaborator per spec.md §1 — but it
//! does everything around it: unfolding and parsing `DKIM-Signature:`
//! headers into a structured inventory, extracting `ARC-*` metadata, and
//! selecting which signing domain DMARC should align against.
//!
//! Grounded on `examples/original_source/dkim_evaluator.py`. Its regular
//! expressions lean on Python's negative-lookahead support
//! (`(?!\s)`) to stop a folded header at the next unindented line; the
//! `regex` crate has no lookaround, so header unfolding here is a small
//! hand-written line scanner instead (mirroring the ARC-extraction loop
//! the same Python module already does by hand for the same reason). Tag
//! extraction from an unfolded header value has no such requirement and
//! uses `regex`, matching the teacher's own use of `regex` in
//! `crates/smtp`.

use std::fmt;

use regex::Regex;
use std::sync::OnceLock;

/// Configuration for the DKIM inventory/verifier boundary. Mirrors the
/// shape of the teacher's `DkimVerificationConfig`: a small set of limits
/// rather than behavior toggles, since the actual cryptographic checks
/// are out of scope.
#[derive(Debug, Clone)]
pub struct DkimConfig {
    /// Upper bound on the number of `DKIM-Signature` headers inventoried,
    /// guarding against a pathological message with thousands of headers.
    pub max_signatures: usize,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            max_signatures: 32,
        }
    }
}

/// One retained `DKIM-Signature` header: present only when its `d` and
/// `s` tags were both found, per spec.md §4.5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimSignature {
    /// `d=` tag, lowercased.
    pub d: String,
    /// `s=` tag, verbatim (selectors are case-sensitive).
    pub s: String,
    /// `a=` tag, if present.
    pub a: Option<String>,
    /// `c=` tag, if present.
    pub c: Option<String>,
    /// The unfolded header value this signature was parsed from.
    pub raw: String,
}

/// Informational ARC metadata. Never influences `dkim_result` or the
/// DMARC verdict — ARC re-verification is explicitly out of scope
/// (spec.md §1 Non-goals).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArcInfo {
    pub present: bool,
    /// `d=` tag of the `ARC-Seal` header, when present.
    pub signer: Option<String>,
    /// The unfolded `ARC-Authentication-Results` header value, when
    /// present.
    pub authentication_results: Option<String>,
    /// Fixed advisory text attached whenever a seal is found, carried
    /// over from the reference prototype (`dkim_evaluator.py::_extract_arc_info`)
    /// so callers don't have to invent this copy themselves.
    pub note: Option<String>,
}

const ARC_NOTE: &str = "ARC indicates the message was authenticated by an upstream receiver. \
DKIM verification may fail locally due to header modifications. ARC is informational and not \
cryptographically re-verified.";

/// Outcome of the cryptographic verifier oracle, normalized to the five
/// values spec.md §4.6 names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DkimResult {
    Pass,
    Fail,
    TempError,
    PermError,
    None,
}

impl DkimResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, DkimResult::Pass)
    }
}

impl fmt::Display for DkimResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DkimResult::Pass => write!(f, "PASS"),
            DkimResult::Fail => write!(f, "FAIL"),
            DkimResult::TempError => write!(f, "TEMPERROR"),
            DkimResult::PermError => write!(f, "PERMERROR"),
            DkimResult::None => write!(f, "NONE"),
        }
    }
}

/// Thin boundary over the actual cryptographic verifier, so this crate
/// and its tests never depend on a concrete DKIM implementation. A
/// production caller supplies an adapter that calls into a real verifier
/// (e.g. `mail-auth`'s `Dkim::verify`); tests supply a scripted stand-in.
#[async_trait::async_trait]
pub trait DkimVerifier: Send + Sync {
    /// Verifies every DKIM signature in `raw_message` and returns a
    /// single normalized outcome: PASS if at least one signature
    /// cryptographically verifies, FAIL if all fail, TEMPERROR on
    /// infrastructure failure (e.g. a key lookup timeout), PERMERROR on
    /// malformed signatures.
    async fn verify(&self, raw_message: &[u8]) -> DkimResult;
}

/// Complete DKIM evaluation for one message: the verifier's outcome plus
/// the structural inventory used for DMARC identity selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimCheck {
    pub present: bool,
    pub result: DkimResult,
    pub signatures: Vec<DkimSignature>,
    pub arc: ArcInfo,
    /// The signing domain DMARC should test for alignment, per the
    /// selection rule in spec.md §4.5. `None` when there are no retained
    /// signatures at all.
    pub selected_domain: Option<String>,
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([a-zA-Z]+)\s*=\s*([^;]+)").expect("static pattern"))
}

/// Splits `raw` on the first CRLFCRLF, returning the header block.
/// Messages that use bare LF line endings are tolerated by also
/// accepting `\n\n` as the boundary, since real-world mail is not always
/// strictly CRLF.
fn header_block(raw: &[u8]) -> &[u8] {
    if let Some(pos) = find_subslice(raw, b"\r\n\r\n") {
        &raw[..pos]
    } else if let Some(pos) = find_subslice(raw, b"\n\n") {
        &raw[..pos]
    } else {
        raw
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Splits a header block into unfolded `(name, value)` pairs, where
/// folded continuation lines (any line starting with whitespace) have
/// been joined onto the previous line with a single space, per spec.md
/// §4.5.
fn unfolded_headers(block: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(block);
    let mut headers = Vec::new();
    let mut current: Option<(String, String)> = None;

    for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some(done) = current.take() {
            headers.push(done);
        }
        if let Some((name, value)) = line.split_once(':') {
            current = Some((name.trim().to_string(), value.trim().to_string()));
        }
    }
    if let Some(done) = current.take() {
        headers.push(done);
    }
    headers
}

fn parse_tags(value: &str) -> std::collections::HashMap<String, String> {
    let mut tags = std::collections::HashMap::new();
    for cap in tag_regex().captures_iter(value) {
        let name = cap[1].to_ascii_lowercase();
        let val = cap[2].trim().to_string();
        tags.entry(name).or_insert(val);
    }
    tags
}

/// Extracts every retained `DKIM-Signature` header from the raw message.
pub fn extract_signatures(raw_message: &[u8], config: &DkimConfig) -> Vec<DkimSignature> {
    let headers = unfolded_headers(header_block(raw_message));
    let mut signatures = Vec::new();

    for (name, value) in &headers {
        if !name.eq_ignore_ascii_case("dkim-signature") {
            continue;
        }
        if signatures.len() >= config.max_signatures {
            break;
        }
        let tags = parse_tags(value);
        let (Some(d), Some(s)) = (tags.get("d"), tags.get("s")) else {
            continue;
        };
        signatures.push(DkimSignature {
            d: d.to_ascii_lowercase(),
            s: s.clone(),
            a: tags.get("a").cloned(),
            c: tags.get("c").cloned(),
            raw: value.clone(),
        });
    }
    signatures
}

/// Extracts ARC metadata from the raw message. Informational only.
pub fn extract_arc_info(raw_message: &[u8]) -> ArcInfo {
    let headers = unfolded_headers(header_block(raw_message));

    let seal = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("arc-seal"));
    let Some((_, seal_value)) = seal else {
        return ArcInfo::default();
    };

    let signer = parse_tags(seal_value).get("d").cloned();
    let authentication_results = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("arc-authentication-results"))
        .map(|(_, value)| value.clone());

    ArcInfo {
        present: true,
        signer,
        authentication_results,
        note: Some(ARC_NOTE.to_string()),
    }
}

/// Selects which retained signature's `d` DMARC should test for
/// alignment, per spec.md §4.5:
/// 1. The first signature whose `d` equals `header_from` or of which
///    `header_from` is a subdomain.
/// 2. Otherwise the first retained signature.
/// 3. `None` if there are no retained signatures.
pub fn select_dkim_identity(signatures: &[DkimSignature], header_from: &str) -> Option<String> {
    let header_from = header_from.to_ascii_lowercase();
    if let Some(sig) = signatures.iter().find(|sig| {
        header_from == sig.d || header_from.ends_with(&format!(".{}", sig.d))
    }) {
        return Some(sig.d.clone());
    }
    signatures.first().map(|sig| sig.d.clone())
}

/// Runs the full DKIM check for one message: inventory, ARC metadata,
/// verifier outcome, and DMARC identity selection.
pub async fn check(
    raw_message: &[u8],
    header_from: &str,
    verifier: &dyn DkimVerifier,
    config: &DkimConfig,
) -> DkimCheck {
    let signatures = extract_signatures(raw_message, config);
    let arc = extract_arc_info(raw_message);

    if signatures.is_empty() {
        return DkimCheck {
            present: false,
            result: DkimResult::None,
            signatures,
            arc,
            selected_domain: None,
        };
    }

    let result = verifier.verify(raw_message).await;
    let selected_domain = select_dkim_identity(&signatures, header_from);

    DkimCheck {
        present: true,
        result,
        signatures,
        arc,
        selected_domain,
    }
}
