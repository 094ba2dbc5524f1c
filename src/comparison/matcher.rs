//! Response matcher
//!
//! Compares the primary response with one shadow result under [`MatchRules`].

use std::collections::{BTreeSet, HashSet};

use serde_json::Value;

use super::body::{compare_bodies, BodyRules};
use super::HOP_BY_HOP_HEADERS;
use crate::config::MatchRules;
use crate::models::{
    DiffLocation, DiffReason, Discrepancy, HeaderDifference, Headers, PrimaryResponse,
    ShadowOutcome, ShadowResponse, ShadowResult,
};

/// Result of comparing the primary with one shadow
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    pub status_match: bool,
    pub body_match: bool,
    pub header_differences: Vec<HeaderDifference>,
    /// Status, body and failure discrepancies
    pub discrepancies: Vec<Discrepancy>,
}

impl MatchOutcome {
    pub fn matched(&self) -> bool {
        self.status_match && self.body_match && self.header_differences.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ResponseMatcher {
    ignored_headers: HashSet<String>,
    significant_headers: Option<BTreeSet<String>>,
    body_rules: BodyRules,
}

impl ResponseMatcher {
    pub fn new(rules: &MatchRules) -> Self {
        let lower = |h: &String| h.trim().to_ascii_lowercase();
        let significant: BTreeSet<String> = rules.significant_headers.iter().map(lower).collect();
        Self {
            ignored_headers: rules
                .ignored_headers
                .iter()
                .map(lower)
                .chain(HOP_BY_HOP_HEADERS.iter().map(|h| h.to_string()))
                .collect(),
            significant_headers: (!significant.is_empty()).then_some(significant),
            body_rules: BodyRules::new(&rules.ignore_paths, rules.array_order_sensitive),
        }
    }

    /// Compare the primary response against one shadow slot
    pub fn compare(&self, primary: &PrimaryResponse, shadow: &ShadowResult) -> MatchOutcome {
        match &shadow.outcome {
            ShadowOutcome::Responded(response) => self.compare_response(primary, response),
            ShadowOutcome::Failed(failure) => MatchOutcome {
                status_match: false,
                body_match: false,
                header_differences: Vec::new(),
                discrepancies: vec![Discrepancy {
                    location: DiffLocation::Response,
                    reason: failure.kind.into(),
                    primary: None,
                    shadow: Some(Value::String(failure.message.clone())),
                }],
            },
        }
    }

    fn compare_response(&self, primary: &PrimaryResponse, shadow: &ShadowResponse) -> MatchOutcome {
        let mut discrepancies = Vec::new();

        let status_match = primary.status_code == shadow.status_code;
        if !status_match {
            discrepancies.push(Discrepancy {
                location: DiffLocation::Status,
                reason: DiffReason::StatusMismatch,
                primary: Some(Value::from(primary.status_code)),
                shadow: Some(Value::from(shadow.status_code)),
            });
        }

        let body_diffs = compare_bodies(
            primary.body.as_ref(),
            shadow.body.as_ref(),
            &self.body_rules,
        );
        let body_match = body_diffs.is_empty();
        discrepancies.extend(body_diffs);

        MatchOutcome {
            status_match,
            body_match,
            header_differences: self.compare_headers(&primary.headers, &shadow.headers),
            discrepancies,
        }
    }

    fn is_compared(&self, key: &str) -> bool {
        if HOP_BY_HOP_HEADERS.contains(&key) {
            return false;
        }
        match &self.significant_headers {
            Some(allow) => allow.contains(key),
            None => !self.ignored_headers.contains(key),
        }
    }

    /// Header differences in key order. Values are compared as ordered lists.
    pub fn compare_headers(&self, primary: &Headers, shadow: &Headers) -> Vec<HeaderDifference> {
        let keys: BTreeSet<&str> = match &self.significant_headers {
            Some(allow) => allow.iter().map(String::as_str).collect(),
            None => primary.keys().chain(shadow.keys()).collect(),
        };

        keys.into_iter()
            .filter(|key| self.is_compared(key))
            .filter_map(|key| {
                let p = primary.get(key).unwrap_or_default();
                let s = shadow.get(key).unwrap_or_default();
                (p != s).then(|| HeaderDifference {
                    key: key.to_string(),
                    primary: p.to_vec(),
                    shadow: s.to_vec(),
                })
            })
            .collect()
    }
}
