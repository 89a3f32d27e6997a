/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! SPF macro expansion (RFC 7208 §7), restricted to the substitution
//! environment this crate needs: sender, HELO, client IP, evaluation
//! domain and current time.

use std::net::IpAddr;

/// Fixed substitution environment for one SPF evaluation. `d` changes at
/// every recursion level (`include`/`redirect`), so callers clone with
/// [`MacroEnv::with_domain`] rather than rebuilding the whole environment.
#[derive(Debug, Clone)]
pub struct MacroEnv {
    /// `%{s}` — mail_from, verbatim (no `postmaster@<helo>` fallback).
    pub s: String,
    /// `%{l}` — local part of `s`.
    pub l: String,
    /// `%{o}` — domain part of `s`.
    pub o: String,
    /// `%{d}` — current evaluation domain.
    pub d: String,
    /// `%{h}` — HELO/EHLO domain.
    pub h: String,
    /// `%{r}` — receiving domain, always equal to `d` in this design.
    pub r: String,
    /// `%{t}` — evaluation time, decimal Unix timestamp.
    pub t: String,
    pub ip: IpAddr,
}

impl MacroEnv {
    pub fn with_domain(&self, d: &str) -> MacroEnv {
        MacroEnv {
            d: d.to_string(),
            r: d.to_string(),
            ..self.clone()
        }
    }
}

fn raw_value(letter: char, env: &MacroEnv) -> Option<String> {
    match letter.to_ascii_lowercase() {
        's' => Some(env.s.clone()),
        'l' => Some(env.l.clone()),
        'o' => Some(env.o.clone()),
        'd' => Some(env.d.clone()),
        'i' | 'c' => Some(env.ip.to_string()),
        'h' => Some(env.h.clone()),
        'r' => Some(env.r.clone()),
        't' => Some(env.t.clone()),
        'v' => Some(if env.ip.is_ipv4() { "in-addr".to_string() } else { "ip6".to_string() }),
        _ => None,
    }
}

fn default_delim(letter: char, env: &MacroEnv) -> char {
    match letter.to_ascii_lowercase() {
        'i' | 'c' => {
            if env.ip.is_ipv4() {
                '.'
            } else {
                ':'
            }
        }
        _ => '.',
    }
}

/// Expands one `%{...}` body (the text between the braces, not including
/// them): a macro letter, an optional positive decimal digit count, an
/// optional `r`/`R` reverse flag, and optional trailing delimiter
/// characters.
fn expand_macro_body(body: &str, env: &MacroEnv) -> String {
    let chars: Vec<char> = body.chars().collect();
    let Some(&letter) = chars.first() else {
        return String::new();
    };
    let Some(raw) = raw_value(letter, env) else {
        return String::new();
    };

    let mut idx = 1;
    let mut digits = String::new();
    while idx < chars.len() && chars[idx].is_ascii_digit() {
        digits.push(chars[idx]);
        idx += 1;
    }
    let keep_rightmost: Option<usize> = if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    };

    let reverse = idx < chars.len() && (chars[idx] == 'r' || chars[idx] == 'R');
    if reverse {
        idx += 1;
    }

    let delim_chars = &chars[idx..];
    let delims: Vec<char> = if delim_chars.is_empty() {
        vec![default_delim(letter, env)]
    } else {
        delim_chars.to_vec()
    };

    let mut parts: Vec<&str> = raw
        .split(|c| delims.contains(&c))
        .filter(|part| !part.is_empty())
        .collect();

    if let Some(n) = keep_rightmost {
        if parts.len() > n {
            let skip = parts.len() - n;
            parts = parts[skip..].to_vec();
        }
    }

    if reverse {
        parts.reverse();
    }

    parts.join(".")
}

/// Expands every `%`-escape and `%{...}` macro in `template` against `env`.
///
/// A string with no `%` byte is returned unchanged. `%%`, `%_` and `%-`
/// expand to `%`, a space and `-` respectively. A `%{` with no matching
/// `}` is malformed and is skipped by consuming only the `%` byte, so the
/// rest of the input (including the stray `{`) is scanned as literal text.
pub fn expand_macros(template: &str, env: &MacroEnv) -> String {
    if !template.contains('%') {
        return template.to_string();
    }

    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        match chars.get(i + 1) {
            Some('%') => {
                out.push('%');
                i += 2;
            }
            Some('_') => {
                out.push(' ');
                i += 2;
            }
            Some('-') => {
                out.push('-');
                i += 2;
            }
            Some('{') => {
                if let Some(close_offset) = chars[i + 2..].iter().position(|&c| c == '}') {
                    let body: String = chars[i + 2..i + 2 + close_offset].iter().collect();
                    out.push_str(&expand_macro_body(&body, env));
                    i = i + 2 + close_offset + 1;
                } else {
                    i += 1;
                }
            }
            _ => {
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> MacroEnv {
        MacroEnv {
            s: "sender@example.com".to_string(),
            l: "sender".to_string(),
            o: "example.com".to_string(),
            d: "example.com".to_string(),
            h: "mail.example.com".to_string(),
            r: "example.com".to_string(),
            t: "1700000000".to_string(),
            ip: "192.0.2.5".parse().unwrap(),
        }
    }

    #[test]
    fn string_without_percent_is_unchanged() {
        let input = "v=spf1 include:_spf.example.com -all";
        assert_eq!(expand_macros(input, &env()), input);
    }

    #[test]
    fn expands_domain_macro() {
        assert_eq!(expand_macros("%{d}", &env()), "example.com");
    }

    #[test]
    fn expands_escapes() {
        assert_eq!(expand_macros("%%-%_-%-", &env()), "%- --");
    }

    #[test]
    fn expands_ip_macro_reversed() {
        assert_eq!(expand_macros("%{ir}", &env()), "5.2.0.192");
    }

    #[test]
    fn truncates_to_rightmost_n_parts() {
        let mut e = env();
        e.d = "a.b.c.example.com".to_string();
        assert_eq!(expand_macros("%{d2}", &e), "example.com");
    }

    #[test]
    fn truncate_then_reverse_order_matches_rfc() {
        // domain a.b.c.d, %{d2r}: keep rightmost 2 ("c", "d"), then reverse
        // to "d.c" — truncating after reversing would instead yield "b.a".
        let mut e = env();
        e.d = "a.b.c.d".to_string();
        assert_eq!(expand_macros("%{d2r}", &e), "d.c");
    }

    #[test]
    fn unknown_letter_yields_empty_string() {
        assert_eq!(expand_macros("[%{z}]", &env()), "[]");
    }

    #[test]
    fn malformed_macro_without_closing_brace_consumes_one_byte() {
        assert_eq!(expand_macros("%{d", &env()), "{d");
    }
}
