//! OWNERS / OWNERS_ALIASES resolution. Approvers and reviewers may name
//! aliases; aliases may name other aliases. Expansion visits each alias at
//! most once, so cycles terminate.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct OwnersFile {
    #[serde(default)]
    approvers: Vec<String>,
    #[serde(default)]
    reviewers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AliasesFile {
    #[serde(default)]
    aliases: BTreeMap<String, Vec<String>>,
}

/// The set of logins granted access through the repository's OWNERS file.
#[derive(Debug, Default)]
pub struct Owners {
    members: HashSet<String>,
}

impl Owners {
    pub fn parse(owners: &str, owners_aliases: Option<&str>) -> anyhow::Result<Self> {
        let owners: OwnersFile = match owners.trim() {
            "" => OwnersFile::default(),
            content => serde_yaml::from_str(content)?,
        };
        let aliases: AliasesFile = match owners_aliases.map(str::trim) {
            Some("") | None => AliasesFile::default(),
            Some(content) => serde_yaml::from_str(content)?,
        };

        let mut members = HashSet::new();
        let mut visited = HashSet::new();
        for entry in owners.approvers.iter().chain(owners.reviewers.iter()) {
            expand(entry, &aliases.aliases, &mut visited, &mut members);
        }
        Ok(Self { members })
    }

    pub fn contains(&self, login: &str) -> bool {
        self.members.contains(&login.to_lowercase())
    }
}

fn expand(
    entry: &str,
    aliases: &BTreeMap<String, Vec<String>>,
    visited: &mut HashSet<String>,
    members: &mut HashSet<String>,
) {
    if let Some(expanded) = aliases.get(entry) {
        // Revisiting an alias is a no-op, which breaks cycles.
        if !visited.insert(entry.to_string()) {
            return;
        }
        for inner in expanded {
            expand(inner, aliases, visited, members);
        }
    } else {
        members.insert(entry.to_lowercase());
    }
}
