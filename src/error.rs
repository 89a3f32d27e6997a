/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Error types shared across the DNS facade, SPF evaluator, DKIM inventory
//! and DMARC evaluator.
//!
//! Protocol-level outcomes (SPF PERMERROR/TEMPERROR, DMARC PERMERROR, ...)
//! are first-class variants of their respective result enums, not errors —
//! a malformed SPF record is a normal, expected evaluation outcome. The
//! types here cover conditions that are exceptional at the Rust level:
//! configuration mistakes and failures in the surrounding plumbing.

use std::fmt;

/// Errors surfaced by the DNS facade when a query cannot even be attempted
/// (as opposed to a query that completes with NXDOMAIN/NODATA, which is
/// represented as a `DnsStatus`, not an error).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// The resolver backend could not be constructed or configured.
    Configuration { reason: String },
    /// The name could not be parsed as a DNS name.
    InvalidName { name: String },
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsError::Configuration { reason } => {
                write!(f, "DNS resolver configuration error: {reason}")
            }
            DnsError::InvalidName { name } => {
                write!(f, "invalid DNS name: '{name}'")
            }
        }
    }
}

impl std::error::Error for DnsError {}

/// Errors raised by the orchestrator when a request cannot be evaluated at
/// all, distinct from a completed evaluation whose result happens to be
/// PERMERROR/TEMPERROR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// `sender_ip` did not parse as an IPv4 or IPv6 literal.
    InvalidSenderIp { value: String },
    /// `domain` was empty.
    EmptyDomain,
    /// The per-request deadline (default 10s) elapsed before the check
    /// could complete.
    DeadlineExceeded,
    /// `raw_email_b64` was not strict base64, per spec.md §6.
    InvalidBase64,
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::InvalidSenderIp { value } => {
                write!(f, "'{value}' is not a valid IPv4 or IPv6 address")
            }
            CheckError::EmptyDomain => write!(f, "domain must not be empty"),
            CheckError::DeadlineExceeded => {
                write!(f, "check did not complete within the per-request deadline")
            }
            CheckError::InvalidBase64 => {
                write!(f, "raw_email_b64 is not valid base64")
            }
        }
    }
}

impl std::error::Error for CheckError {}
