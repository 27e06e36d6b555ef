// Duplicates share a slash-terminated well-known URL and a username. An earlier
// record whose stored well-known ends in `/` is replaced by the later one;
// otherwise the later one is dropped. Suspect heuristic, kept as is.

use std::collections::HashMap;

use crate::accounts::AccountDirectory;
use crate::urls::{ensure_trailing_slash, strip_trailing_slash};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupeReport {
    pub removed: Vec<String>,
    pub renamed: Vec<(String, String)>,
}

impl DedupeReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.renamed.is_empty()
    }
}

pub fn dedupe_key(well_known: &str, username: &str) -> String {
    format!("{}{}", ensure_trailing_slash(well_known), username)
}

pub fn dedupe(directory: &mut AccountDirectory) -> DedupeReport {
    let mut report = DedupeReport::default();
    // dedupe key -> (identity, stored well-known URL)
    let mut seen: HashMap<String, (String, String)> = HashMap::new();
    let mut survivors: HashMap<String, String> = HashMap::new();

    let identities: Vec<String> = directory.accounts.keys().cloned().collect();
    for identity in identities {
        let Some(record) = directory.accounts.get(&identity) else {
            continue;
        };
        let well_known = record.server_urls.wellknown.clone();
        let key = dedupe_key(&well_known, record.username.as_deref().unwrap_or_default());

        let Some((previous_identity, previous_well_known)) = seen.get(&key).cloned() else {
            seen.insert(key, (identity, well_known));
            continue;
        };

        if previous_well_known.ends_with('/') {
            directory.accounts.shift_remove(&previous_identity);
            tracing::debug!(
                removed = %previous_identity,
                kept = %identity,
                "duplicate account replaced"
            );
            survivors.insert(previous_identity.clone(), identity.clone());
            report.removed.push(previous_identity);
            seen.insert(key, (identity, well_known));
        } else {
            directory.accounts.shift_remove(&identity);
            tracing::debug!(
                removed = %identity,
                kept = %previous_identity,
                "duplicate account dropped"
            );
            survivors.insert(identity.clone(), previous_identity);
            report.removed.push(identity);
        }
    }

    let slash_terminated: Vec<String> = directory
        .accounts
        .keys()
        .filter(|identity| identity.ends_with('/'))
        .cloned()
        .collect();
    for identity in slash_terminated {
        let Some(record) = directory.accounts.shift_remove(&identity) else {
            continue;
        };
        let renamed = strip_trailing_slash(&identity).to_string();
        directory.accounts.insert(renamed.clone(), record);
        report.renamed.push((identity, renamed));
    }

    retarget_current(directory, &survivors, &report.renamed);
    report
}

/// Keeps the current-account pointer on the record that replaced it.
fn retarget_current(
    directory: &mut AccountDirectory,
    survivors: &HashMap<String, String>,
    renamed: &[(String, String)],
) {
    let Some(mut current) = directory.current_account_key.clone() else {
        return;
    };
    // A survivor may itself have been replaced later in the scan.
    let mut hops = 0;
    while let Some(next) = survivors.get(&current) {
        current = next.clone();
        hops += 1;
        if hops > survivors.len() {
            break;
        }
    }
    if let Some((_, to)) = renamed.iter().find(|(from, _)| *from == current) {
        current = to.clone();
    }
    directory.current_account_key = Some(current);
}
