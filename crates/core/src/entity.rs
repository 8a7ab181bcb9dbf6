use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One legal company of the group: at most one bank profile and one
/// accounting subsidiary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub key: String,
    pub profile_id: i64,
    pub subsidiary_id: i64,
    pub display_name: String,
    pub jurisdiction: String,
    pub currency: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub known_ibans: Vec<String>,
}

/// Lookup table over the configured group entities. Rebuilt wholesale on
/// config reload and swapped in behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct EntityMap {
    entities: Vec<Entity>,
    by_profile: HashMap<i64, usize>,
    by_name: HashMap<String, usize>,
    by_iban: HashMap<String, usize>,
}

/// Lowercased, punctuation-stripped, whitespace-collapsed form used for
/// name and alias comparison.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// IBANs compare with spaces removed, uppercased.
pub fn normalize_iban(iban: &str) -> String {
    iban.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

impl EntityMap {
    pub fn new(entities: Vec<Entity>) -> Self {
        let mut by_profile = HashMap::new();
        let mut by_name = HashMap::new();
        let mut by_iban = HashMap::new();

        for (idx, entity) in entities.iter().enumerate() {
            by_profile.insert(entity.profile_id, idx);
            by_name.insert(normalize_name(&entity.display_name), idx);
            for alias in &entity.aliases {
                by_name.insert(normalize_name(alias), idx);
            }
            for iban in &entity.known_ibans {
                by_iban.insert(normalize_iban(iban), idx);
            }
        }

        EntityMap {
            entities,
            by_profile,
            by_name,
            by_iban,
        }
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn by_profile(&self, profile_id: i64) -> Option<&Entity> {
        self.by_profile.get(&profile_id).map(|&i| &self.entities[i])
    }

    /// Exact match over normalized display names and aliases.
    pub fn match_name(&self, name: &str) -> Option<&Entity> {
        self.by_name
            .get(&normalize_name(name))
            .map(|&i| &self.entities[i])
    }

    pub fn match_iban(&self, iban: &str) -> Option<&Entity> {
        self.by_iban
            .get(&normalize_iban(iban))
            .map(|&i| &self.entities[i])
    }

    pub fn is_known_iban(&self, iban: &str) -> bool {
        self.match_iban(iban).is_some()
    }

    /// Scan free text for any entity display name or alias; first hit wins
    /// in configuration order.
    pub fn find_in_text(&self, text: &str) -> Option<&Entity> {
        let haystack = normalize_name(text);
        self.entities.iter().find(|entity| {
            let mut needles = vec![normalize_name(&entity.display_name)];
            needles.extend(entity.aliases.iter().map(|a| normalize_name(a)));
            needles
                .into_iter()
                .any(|needle| !needle.is_empty() && haystack.contains(&needle))
        })
    }
}
