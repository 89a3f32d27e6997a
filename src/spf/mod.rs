/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Sender Policy Framework: record fetch, macro expansion, the recursive
//! evaluator, and a non-evaluating record-tree walk.

pub mod eval;
pub mod macros;
pub mod mechanism;
pub mod record;
pub mod tree;

pub use eval::{run, EvalState, SpfConfig, SpfResult, MAX_RECURSION_DEPTH, MAX_SPF_LOOKUPS};
pub use macros::{expand_macros, MacroEnv};
pub use mechanism::{Mechanism, MechanismKind, Modifier, Qualifier, Term};
pub use record::{fetch_spf, FetchedRecord};
pub use tree::{build_spf_tree, SpfRecordTree};
