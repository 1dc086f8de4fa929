//! Reading model output as a list constrained to a vocabulary or format.

use serde_json::Value;

use crate::error::ParseError;

/// Decides which list items a structured step may return.
pub trait ItemValidator: Send + Sync {
    /// Canonical form of `item`, or `None` to discard it.
    fn validate(&self, item: &str) -> Option<String>;

    /// Best-effort recovery from a response that is not a JSON list.
    fn heuristic(&self, raw: &str) -> Vec<String>;
}

pub static PIL_THEMES: [&str; 20] = [
    "Choice of Law Clauses",
    "Contractual Obligations",
    "Cross-border Transactions",
    "Party Autonomy",
    "Connecting Factors",
    "Most Significant Relationship",
    "Mandatory Rules",
    "Public Policy",
    "Renvoi",
    "Characterization",
    "Tort Law",
    "Property Rights",
    "Family Law",
    "Succession Law",
    "Corporate Law",
    "Consumer Protection",
    "Employment Law",
    "Intellectual Property",
    "International Arbitration",
    "Recognition and Enforcement",
];

/// Fixed theme vocabulary. Matching ignores case and surrounding space.
pub struct ThemeVocabulary;

impl ItemValidator for ThemeVocabulary {
    fn validate(&self, item: &str) -> Option<String> {
        let item = item.trim();
        PIL_THEMES
            .iter()
            .find(|t| t.eq_ignore_ascii_case(item))
            .map(|t| t.to_string())
    }

    fn heuristic(&self, raw: &str) -> Vec<String> {
        let lower = raw.to_lowercase();
        PIL_THEMES
            .iter()
            .filter(|t| lower.contains(&t.to_lowercase()))
            .map(|t| t.to_string())
            .collect()
    }
}

/// Citations of the form "Art. 187, PILA". "NA" means none were cited.
pub struct ProvisionFormat;

pub const NO_PROVISIONS: &str = "NA";
const MAX_PROVISION_LEN: usize = 200;
const CITATION_MARKERS: [&str; 5] = ["art.", "article ", "section ", "§", "restatement"];

fn looks_like_citation(item: &str) -> bool {
    let lower = item.to_lowercase();
    item.chars().any(|c| c.is_ascii_digit()) || CITATION_MARKERS.iter().any(|m| lower.contains(m))
}

impl ItemValidator for ProvisionFormat {
    fn validate(&self, item: &str) -> Option<String> {
        let item = item.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if item.is_empty() || item.contains('\n') || item.chars().count() > MAX_PROVISION_LEN {
            return None;
        }
        if item.eq_ignore_ascii_case("na") || item.eq_ignore_ascii_case("n/a") {
            return Some(NO_PROVISIONS.to_string());
        }
        looks_like_citation(item).then(|| item.to_string())
    }

    fn heuristic(&self, raw: &str) -> Vec<String> {
        raw.lines()
            .map(|l| l.trim().trim_start_matches(['-', '*', '•']).trim())
            .filter(|l| {
                let lower = l.to_lowercase();
                CITATION_MARKERS.iter().any(|m| lower.contains(m))
            })
            .filter_map(|l| self.validate(l.trim_end_matches(',')))
            .collect()
    }
}

/// Parse `raw` as a JSON array of strings, keeping only items the validator
/// accepts. Code fences and prose around the array are tolerated. Duplicates
/// are dropped and order is preserved.
pub fn parse_constrained_list<V>(raw: &str, validator: &V) -> Result<Vec<String>, ParseError>
where
    V: ItemValidator + ?Sized,
{
    let body = strip_fences(raw.trim());
    if body.is_empty() {
        return Err(ParseError::Empty);
    }

    let (Some(start), Some(end)) = (body.find('['), body.rfind(']')) else {
        return Err(ParseError::NotAList);
    };
    if end < start {
        return Err(ParseError::NotAList);
    }

    let value: Value = serde_json::from_str(&body[start..=end])
        .map_err(|e| ParseError::Malformed(e.to_string()))?;
    let Value::Array(items) = value else {
        return Err(ParseError::NotAList);
    };

    let mut out: Vec<String> = Vec::new();
    for item in items.iter().filter_map(Value::as_str) {
        if let Some(valid) = validator.validate(item) {
            if !out.contains(&valid) {
                out.push(valid);
            }
        }
    }
    if out.is_empty() {
        return Err(ParseError::NoValidItems);
    }
    Ok(out)
}

fn strip_fences(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
