// classify.rs
// description: Splits CRM mirror rows into excluded (audition / free trial) and eligible accounts.

use crate::records::{AccountId, ExcludedRecord, SourceRecord};

const EXCLUSION_TAGS: [&str; 2] = ["audition", "free trial"];

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Classification {
    pub excluded: Vec<ExcludedRecord>,
    /// Tagged rows whose identifier is blank. Excluded, but there is no key to write them under.
    pub unkeyed: Vec<SourceRecord>,
    pub eligible: Vec<SourceRecord>,
    /// Untagged rows with a blank display name. Kept only for counting.
    pub dropped: Vec<SourceRecord>,
}

/// Reasons matched by a temp label, in fixed tag order.
pub fn exclusion_reasons(temp_label: &str) -> Vec<&'static str> {
    let lower = temp_label.trim().to_lowercase();
    EXCLUSION_TAGS
        .iter()
        .copied()
        .filter(|tag| lower.contains(tag))
        .collect()
}

/// Every input row lands in exactly one of the outputs. `excluded` and `unkeyed` together
/// make up the excluded set.
pub fn classify(rows: &[SourceRecord]) -> Classification {
    let mut out = Classification::default();
    for row in rows {
        let temp = row.temp_label.trim();
        let name = row.display_name.trim();
        let reasons = exclusion_reasons(temp);
        if !reasons.is_empty() {
            match AccountId::parse(&row.identifier_text()) {
                Ok(account_id) => out.excluded.push(ExcludedRecord {
                    account_id,
                    reason: reasons.join(","),
                    tempname: temp.to_string(),
                }),
                Err(_) => out.unkeyed.push(row.clone()),
            }
        } else if !name.is_empty() {
            out.eligible.push(row.clone());
        } else {
            out.dropped.push(row.clone());
        }
    }
    out
}
