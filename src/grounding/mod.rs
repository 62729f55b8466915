//! Grounding checks for generated text.
//!
//! Generated prose may cite identifiers (PubMed ids, DOIs). Every cited
//! identifier must appear in the structured records the text was produced
//! from. Extraction from text is narrow: a bare number is never taken as a
//! PubMed id unless it is labelled as one or appears in a PubMed URL.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::warn;

use crate::error::GroundingViolation;
use crate::metrics::MetricsCollector;

/// Message returned instead of text that failed grounding.
pub const DEFAULT_SUBSTITUTE: &str = "The generated answer cited sources that could not be \
verified against the retrieved records, so it has been withheld. Please review the \
underlying search results directly or retry the request.";

// A label followed by one id or a list of them. List items are separated by
// commas, semicolons, "and", "or" or "&", and may repeat the label.
static PMID_LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\b(?:PMIDs?|PubMed\s+IDs?)\s*[:#=]?\s*",
        r"(\d{1,9}(?:(?:\s*[,;]\s*(?:(?:and|or)\s+|&\s*)?|\s+(?:and|or)\s+|\s*&\s*)",
        r"(?:PMIDs?\s*[:#=]?\s*)?\d{1,9})*)",
    ))
    .expect("pmid pattern is valid")
});

static PUBMED_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)pubmed\.ncbi\.nlm\.nih\.gov/(\d{1,9})").expect("pubmed url pattern is valid")
});

static DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,9}").expect("digits pattern is valid"));

static DOI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b10\.\d{4,9}/[^\s"<>]+"#).expect("doi pattern is valid")
});

const PMID_RECORD_KEYS: [&str; 3] = ["pmid", "pubmed_id", "uid"];
const PMID_LIST_KEYS: [&str; 2] = ["idlist", "pmids"];
const DOI_RECORD_KEYS: [&str; 5] = ["doi", "url", "link", "doi_url", "elocationid"];

/// Identifier families the validator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierScheme {
    PubMed,
    Doi,
}

impl IdentifierScheme {
    /// Identifiers of this scheme cited in free text.
    pub fn extract_from_text(&self, text: &str, out: &mut BTreeSet<String>) {
        match self {
            IdentifierScheme::PubMed => {
                for caps in PMID_LABELLED.captures_iter(text) {
                    for id in DIGITS.find_iter(&caps[1]) {
                        out.insert(normalize_pmid(id.as_str()));
                    }
                }
                for caps in PUBMED_URL.captures_iter(text) {
                    out.insert(normalize_pmid(&caps[1]));
                }
            }
            IdentifierScheme::Doi => {
                for m in DOI.find_iter(text) {
                    out.insert(normalize_doi(m.as_str()));
                }
            }
        }
    }

    /// Identifiers of this scheme present in structured records.
    pub fn extract_from_record(&self, value: &Value, out: &mut BTreeSet<String>) {
        match value {
            Value::Object(map) => {
                if let Some(id) = self.tagged_id(map) {
                    out.insert(id);
                }
                for (key, child) in map {
                    let key = key.to_ascii_lowercase();
                    match self {
                        IdentifierScheme::PubMed if PMID_RECORD_KEYS.contains(&key.as_str()) => {
                            if let Some(id) = scalar_pmid(child) {
                                out.insert(id);
                            }
                        }
                        IdentifierScheme::PubMed if PMID_LIST_KEYS.contains(&key.as_str()) => {
                            if let Value::Array(items) = child {
                                out.extend(items.iter().filter_map(scalar_pmid));
                            }
                        }
                        IdentifierScheme::Doi if DOI_RECORD_KEYS.contains(&key.as_str()) => {
                            if let Value::String(s) = child {
                                if let Some(m) = DOI.find(s) {
                                    out.insert(normalize_doi(m.as_str()));
                                }
                            }
                        }
                        _ => {}
                    }
                    self.extract_from_record(child, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.extract_from_record(item, out);
                }
            }
            _ => {}
        }
    }

    /// An `{"idtype": ..., "value": ...}` pair, as in PubMed `articleids`.
    fn tagged_id(&self, map: &serde_json::Map<String, Value>) -> Option<String> {
        let idtype = map.get("idtype")?.as_str()?.to_ascii_lowercase();
        let value = map.get("value")?;
        match (self, idtype.as_str()) {
            (IdentifierScheme::PubMed, "pubmed" | "pmid") => scalar_pmid(value),
            (IdentifierScheme::Doi, "doi") => value
                .as_str()
                .and_then(|s| DOI.find(s))
                .map(|m| normalize_doi(m.as_str())),
            _ => None,
        }
    }
}

fn normalize_pmid(raw: &str) -> String {
    let trimmed = raw.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn scalar_pmid(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
            Some(normalize_pmid(s))
        }
        Value::Number(n) => n.as_u64().map(|n| n.to_string()),
        _ => None,
    }
}

fn normalize_doi(raw: &str) -> String {
    raw.trim_end_matches(['.', ',', ';', ':', ')', ']', '}', '\'', '"'])
        .to_ascii_lowercase()
}

/// Outcome of one grounding check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroundingCheck {
    pub claimed_ids: BTreeSet<String>,
    pub verified_ids: BTreeSet<String>,
    pub unverified_ids: BTreeSet<String>,
    pub passed: bool,
}

impl GroundingCheck {
    /// Compare cited identifiers against verified ones.
    pub fn new(claimed_ids: BTreeSet<String>, verified_ids: BTreeSet<String>) -> Self {
        let unverified_ids: BTreeSet<String> =
            claimed_ids.difference(&verified_ids).cloned().collect();
        let passed = unverified_ids.is_empty();
        Self {
            claimed_ids,
            verified_ids,
            unverified_ids,
            passed,
        }
    }
}

/// Text that went through grounding, ready to surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundedText {
    /// The original text if the check passed, otherwise the substitute.
    pub text: String,
    pub check: GroundingCheck,
    pub violation: Option<GroundingViolation>,
}

/// Checks generated text against the records it summarizes.
#[derive(Debug, Clone)]
pub struct GroundingValidator {
    schemes: Vec<IdentifierScheme>,
    substitute: String,
    metrics: MetricsCollector,
}

impl Default for GroundingValidator {
    fn default() -> Self {
        Self {
            schemes: vec![IdentifierScheme::PubMed, IdentifierScheme::Doi],
            substitute: DEFAULT_SUBSTITUTE.to_string(),
            metrics: MetricsCollector::new(),
        }
    }
}

impl GroundingValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schemes(mut self, schemes: Vec<IdentifierScheme>) -> Self {
        self.schemes = schemes;
        self
    }

    pub fn with_substitute(mut self, message: impl Into<String>) -> Self {
        self.substitute = message.into();
        self
    }

    pub fn substitute(&self) -> &str {
        &self.substitute
    }

    /// Identifiers cited in `text`.
    pub fn claimed_ids(&self, text: &str) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for scheme in &self.schemes {
            scheme.extract_from_text(text, &mut ids);
        }
        ids
    }

    /// Identifiers present in `records`.
    pub fn verified_ids(&self, records: &Value) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for scheme in &self.schemes {
            scheme.extract_from_record(records, &mut ids);
        }
        ids
    }

    /// Compare `generated_text` with `capability_result`.
    ///
    /// Empty records verify nothing, so any cited identifier fails the check.
    pub fn validate(&self, generated_text: &str, capability_result: &Value) -> GroundingCheck {
        GroundingCheck::new(
            self.claimed_ids(generated_text),
            self.verified_ids(capability_result),
        )
    }

    /// Validate and decide what may be shown.
    ///
    /// On failure the text is replaced by the substitute message and the
    /// mismatch is logged with both identifier sets. The offending ids are
    /// never stripped from the text to make it pass.
    pub fn enforce(&self, task_id: &str, text: String, capability_result: &Value) -> GroundedText {
        let check = self.validate(&text, capability_result);
        self.metrics.record_grounding_check(check.passed);

        if check.passed {
            return GroundedText {
                text,
                check,
                violation: None,
            };
        }

        warn!(
            task_id,
            claimed = ?check.claimed_ids,
            verified = ?check.verified_ids,
            unverified = ?check.unverified_ids,
            "Generated text cites unverified identifiers; substituting output"
        );
        let violation = GroundingViolation {
            task_id: task_id.to_string(),
            check: check.clone(),
        };
        GroundedText {
            text: self.substitute.clone(),
            check,
            violation: Some(violation),
        }
    }
}
