// Copyright (c) The captain Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Composite identifiers for matching local test results against server-side test lists.
//!
//! Quarantined and flaky tests are identified on the server by a composite identifier: a list of
//! component names plus the values those components had when the test was recorded. To check
//! whether a local test is on such a list, captain recomputes the identifier from the local test
//! and compares.

use crate::errors::IdentityError;
use captain_metadata::Test;
use serde::Deserialize;

/// The component name that refers to the test's display name rather than its metadata.
pub const DESCRIPTION_COMPONENT: &str = "description";

/// Substituted for components that are missing when identity isn't strict.
pub const MISSING_IDENTITY_COMPONENT: &str = "MISSING_IDENTITY_COMPONENT";

/// Joins identity components. This string is shared with the backend and must not change.
pub const COMPOSITE_IDENTIFIER_SEPARATOR: &str = " -captain- ";

/// A test as identified by the backend, for example a quarantined or flaky test.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TestIdentity {
    /// The identifier, as computed by the backend.
    pub composite_identifier: String,

    /// The components that make up the identifier, in order.
    pub identity_components: Vec<String>,

    /// If true, a test missing any component can't match this identity.
    #[serde(default)]
    pub strict_identity: bool,
}

impl TestIdentity {
    /// Returns true if `test` has this identity.
    ///
    /// Errors while computing the test's identifier count as a mismatch.
    pub fn matches(&self, test: &Test) -> bool {
        identify(test, &self.identity_components, self.strict_identity)
            .is_ok_and(|identifier| identifier == self.composite_identifier)
    }
}

/// Computes the composite identifier of `test` from `components`.
///
/// Each component is either [`DESCRIPTION_COMPONENT`] (the test's name) or a key into the test's
/// metadata. With `strict`, a missing key is an error; otherwise
/// [`MISSING_IDENTITY_COMPONENT`] is used in its place. Keys present with a null value resolve
/// to the empty string.
pub fn identify(test: &Test, components: &[String], strict: bool) -> Result<String, IdentityError> {
    let meta = test.attempt.meta.as_ref();
    let mut resolved = Vec::with_capacity(components.len());

    for component in components {
        if component == DESCRIPTION_COMPONENT {
            resolved.push(test.name.clone());
            continue;
        }

        let Some(meta) = meta else {
            if strict {
                return Err(IdentityError::MissingMeta {
                    test: test.name.clone(),
                    component: component.clone(),
                });
            }
            resolved.push(MISSING_IDENTITY_COMPONENT.to_owned());
            continue;
        };

        match meta.get(component) {
            Some(value) => resolved.push(component_value(value)),
            None if strict => {
                return Err(IdentityError::MissingComponent {
                    test: test.name.clone(),
                    component: component.clone(),
                });
            }
            None => resolved.push(MISSING_IDENTITY_COMPONENT.to_owned()),
        }
    }

    Ok(resolved.join(COMPOSITE_IDENTIFIER_SEPARATOR))
}

/// Returns true if `test` matches any of `candidates`. The first match wins.
pub fn matches_any<'a>(test: &Test, candidates: impl IntoIterator<Item = &'a TestIdentity>) -> bool {
    candidates.into_iter().any(|candidate| candidate.matches(test))
}

fn component_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
