/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Wall-clock helpers. Kept as a one-function module so the macro
//! expander's `%{t}` substitution and the orchestrator's per-request
//! deadline share a single definition of "now".

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as a decimal Unix timestamp, the representation SPF's
/// `%{t}` macro requires. Clamped to 0 if the system clock is somehow set
/// before the epoch, which should never happen outside a misconfigured
/// test environment.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_a_plausible_timestamp() {
        // Anything after 2021-01-01 is a sane floor for "plausible".
        assert!(unix_timestamp() > 1_600_000_000);
    }
}
