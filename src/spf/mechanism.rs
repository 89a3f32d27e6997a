/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Structured parsing of SPF mechanism and modifier terms.
//!
//! Rather than a chain of prefix checks, terms are tokenized once into a
//! tagged [`Term`] (qualifier, name, target, CIDR) that the evaluator then
//! switches over. This avoids accidental prefix collisions between, say,
//! `ptr` and a hypothetical `ptrX` extension mechanism.

use std::fmt;

use crate::spf::eval::SpfResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn from_prefix(c: char) -> Option<Qualifier> {
        match c {
            '+' => Some(Qualifier::Pass),
            '-' => Some(Qualifier::Fail),
            '~' => Some(Qualifier::SoftFail),
            '?' => Some(Qualifier::Neutral),
            _ => None,
        }
    }

    /// The `SpfResult` a matching mechanism under this qualifier produces.
    pub fn as_result(self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechanismKind {
    All,
    Ip4,
    Ip6,
    A,
    Mx,
    Include,
    Exists,
    Ptr,
    Unknown(String),
}

impl fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MechanismKind::All => write!(f, "all"),
            MechanismKind::Ip4 => write!(f, "ip4"),
            MechanismKind::Ip6 => write!(f, "ip6"),
            MechanismKind::A => write!(f, "a"),
            MechanismKind::Mx => write!(f, "mx"),
            MechanismKind::Include => write!(f, "include"),
            MechanismKind::Exists => write!(f, "exists"),
            MechanismKind::Ptr => write!(f, "ptr"),
            MechanismKind::Unknown(name) => write!(f, "{name}"),
        }
    }
}

/// One mechanism term: `[qualifier] name [":" target] [cidr]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mechanism {
    pub qualifier: Qualifier,
    pub kind: MechanismKind,
    pub target: Option<String>,
    /// Raw CIDR suffix including its leading slash(es), e.g. `"/24"` or
    /// `"/24//64"`. `None` when the term carries no CIDR length at all.
    pub cidr: Option<String>,
    /// The exact token as it appeared in the record, used verbatim in trace
    /// lines.
    pub raw: String,
}

impl Mechanism {
    /// Prefix length for mechanisms that carry a single CIDR length
    /// (`ip4`, `ip6`).
    pub fn single_prefix(&self) -> Option<u8> {
        self.cidr.as_deref()?.strip_prefix('/')?.parse().ok()
    }

    /// `(v4, v6)` prefix lengths for mechanisms that carry a dual-cidr
    /// length (`a`, `mx`): `/p4` sets v4, `//p6` sets v6, both may be
    /// present as `/p4//p6`.
    pub fn dual_prefix(&self) -> (Option<u8>, Option<u8>) {
        let Some(raw) = &self.cidr else {
            return (None, None);
        };
        let mut parts = raw.splitn(2, "//");
        let first = parts.next().unwrap_or("");
        let second = parts.next();
        let v4 = first
            .strip_prefix('/')
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok());
        let v6 = second
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok());
        (v4, v6)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modifier {
    Redirect(String),
    Exp(String),
    /// An unrecognized `name=value` modifier. Per RFC 7208 unknown
    /// modifiers are ignored, not an error.
    Unknown { name: String, value: String },
}

/// A modifier term together with the exact token it was parsed from, kept
/// for trace lines (the evaluator logs "Checking mechanism: <raw>" for
/// every term, mechanism or modifier alike).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifierTerm {
    pub modifier: Modifier,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Mechanism(Mechanism),
    Modifier(ModifierTerm),
}

/// Splits the SPF record body on ASCII whitespace and parses each token,
/// skipping the leading `v=spf1` marker the caller has already matched.
pub fn tokenize(body: &str) -> Vec<Term> {
    body.split_ascii_whitespace()
        .filter(|tok| !tok.is_empty())
        .map(parse_term)
        .collect()
}

fn parse_term(token: &str) -> Term {
    let mut chars = token.char_indices();
    let (qualifier, rest) = match chars.next() {
        Some((_, c)) if Qualifier::from_prefix(c).is_some() => {
            (Qualifier::from_prefix(c).unwrap(), &token[c.len_utf8()..])
        }
        _ => (Qualifier::Pass, token),
    };

    let eq = rest.find('=');
    let colon = rest.find(':');
    let slash = rest.find('/');

    if let Some(eq_idx) = eq {
        let is_modifier = !matches!(colon, Some(c) if c < eq_idx) && !matches!(slash, Some(s) if s < eq_idx);
        if is_modifier {
            let name = rest[..eq_idx].to_ascii_lowercase();
            let value = rest[eq_idx + 1..].to_string();
            let modifier = match name.as_str() {
                "redirect" => Modifier::Redirect(value),
                "exp" => Modifier::Exp(value),
                _ => Modifier::Unknown { name, value },
            };
            return Term::Modifier(ModifierTerm {
                modifier,
                raw: token.to_string(),
            });
        }
    }

    let name_end = [colon, slash]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(rest.len());
    let name = rest[..name_end].to_ascii_lowercase();
    let (target, cidr) = split_target_cidr(&rest[name_end..]);

    let kind = match name.as_str() {
        "all" => MechanismKind::All,
        "ip4" => MechanismKind::Ip4,
        "ip6" => MechanismKind::Ip6,
        "a" => MechanismKind::A,
        "mx" => MechanismKind::Mx,
        "include" => MechanismKind::Include,
        "exists" => MechanismKind::Exists,
        "ptr" => MechanismKind::Ptr,
        other => MechanismKind::Unknown(other.to_string()),
    };

    Term::Mechanism(Mechanism {
        qualifier,
        kind,
        target,
        cidr,
        raw: token.to_string(),
    })
}

fn split_target_cidr(s: &str) -> (Option<String>, Option<String>) {
    if s.is_empty() {
        return (None, None);
    }
    if let Some(stripped) = s.strip_prefix(':') {
        match stripped.find('/') {
            Some(idx) => (
                Some(stripped[..idx].to_string()),
                Some(stripped[idx..].to_string()),
            ),
            None => (Some(stripped.to_string()), None),
        }
    } else {
        (None, Some(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_qualifier_is_pass() {
        match parse_term("all") {
            Term::Mechanism(m) => assert_eq!(m.qualifier, Qualifier::Pass),
            _ => panic!("expected mechanism"),
        }
    }

    #[test]
    fn parses_ip4_with_prefix() {
        match parse_term("ip4:192.0.2.0/24") {
            Term::Mechanism(m) => {
                assert_eq!(m.kind, MechanismKind::Ip4);
                assert_eq!(m.target.as_deref(), Some("192.0.2.0"));
                assert_eq!(m.single_prefix(), Some(24));
            }
            _ => panic!("expected mechanism"),
        }
    }

    #[test]
    fn parses_dual_cidr_for_a() {
        match parse_term("a:mail.example.com/24//64") {
            Term::Mechanism(m) => {
                assert_eq!(m.kind, MechanismKind::A);
                assert_eq!(m.target.as_deref(), Some("mail.example.com"));
                assert_eq!(m.dual_prefix(), (Some(24), Some(64)));
            }
            _ => panic!("expected mechanism"),
        }
    }

    #[test]
    fn parses_dual_cidr_v6_only() {
        match parse_term("a//64") {
            Term::Mechanism(m) => {
                assert_eq!(m.target, None);
                assert_eq!(m.dual_prefix(), (None, Some(64)));
            }
            _ => panic!("expected mechanism"),
        }
    }

    #[test]
    fn parses_qualifiers() {
        match parse_term("-all") {
            Term::Mechanism(m) => {
                assert_eq!(m.qualifier, Qualifier::Fail);
                assert_eq!(m.kind, MechanismKind::All);
                assert_eq!(m.raw, "-all");
            }
            _ => panic!("expected mechanism"),
        }
        match parse_term("~include:example.com") {
            Term::Mechanism(m) => {
                assert_eq!(m.qualifier, Qualifier::SoftFail);
                assert_eq!(m.target.as_deref(), Some("example.com"));
            }
            _ => panic!("expected mechanism"),
        }
    }

    #[test]
    fn parses_redirect_and_exp_modifiers() {
        match parse_term("redirect=_spf.example.com") {
            Term::Modifier(ModifierTerm {
                modifier: Modifier::Redirect(target),
                ..
            }) => {
                assert_eq!(target, "_spf.example.com")
            }
            _ => panic!("expected redirect modifier"),
        }
        match parse_term("exp=explain._spf.example.com") {
            Term::Modifier(ModifierTerm {
                modifier: Modifier::Exp(target),
                ..
            }) => {
                assert_eq!(target, "explain._spf.example.com")
            }
            _ => panic!("expected exp modifier"),
        }
    }

    #[test]
    fn unknown_mechanism_name_preserved() {
        match parse_term("unrecognized-mech:foo") {
            Term::Mechanism(m) => {
                assert_eq!(m.kind, MechanismKind::Unknown("unrecognized-mech".into()))
            }
            _ => panic!("expected mechanism"),
        }
    }

    #[test]
    fn tokenize_splits_on_whitespace() {
        let terms = tokenize("ip4:192.0.2.0/24 -all");
        assert_eq!(terms.len(), 2);
    }
}
