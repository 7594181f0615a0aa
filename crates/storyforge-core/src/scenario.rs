//! Scenario model: the caller-owned story state that handlers read and rewrite.
//!
//! Every struct keeps unknown keys in a flattened `extra` map so that fields
//! the engine does not model survive a round trip back to the caller.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Treat `null` as the type's default. Model output frequently uses `null`
/// for "nothing yet".
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_default")]
    pub synopsis: String,
    #[serde(default, deserialize_with = "null_default")]
    pub backstory: String,
    #[serde(default, deserialize_with = "null_default")]
    pub story_arc: String,
    #[serde(default, deserialize_with = "null_default")]
    pub writing_style: WritingStyle,
    #[serde(default, deserialize_with = "null_default")]
    pub notes: String,
    #[serde(default, deserialize_with = "null_default")]
    pub characters: Vec<Character>,
    #[serde(default, deserialize_with = "null_default")]
    pub locations: Vec<Location>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WritingStyle {
    #[serde(default, deserialize_with = "null_default")]
    pub genre: String,
    #[serde(default, deserialize_with = "null_default")]
    pub tone: String,
    #[serde(default, deserialize_with = "null_default")]
    pub point_of_view: String,
    #[serde(default, deserialize_with = "null_default")]
    pub tense: String,
    #[serde(default, deserialize_with = "null_default")]
    pub style: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WritingStyle {
    pub fn is_empty(&self) -> bool {
        self.genre.is_empty()
            && self.tone.is_empty()
            && self.point_of_view.is_empty()
            && self.tense.is_empty()
            && self.style.is_empty()
            && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    #[serde(default, deserialize_with = "null_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_default")]
    pub role: String,
    #[serde(default, deserialize_with = "null_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_default")]
    pub personality: String,
    #[serde(default, deserialize_with = "null_default")]
    pub appearance: String,
    #[serde(default, deserialize_with = "null_default")]
    pub backstory: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(default, deserialize_with = "null_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_default")]
    pub atmosphere: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Kinds of scenario entities that carry generated ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Character,
    Location,
}

impl EntityKind {
    pub fn id_prefix(&self) -> &'static str {
        match self {
            EntityKind::Character => "char",
            EntityKind::Location => "loc",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Character => "character",
            EntityKind::Location => "location",
        }
    }
}

/// Deterministic entity id: `<kind>_<userId>_<count of that kind>`.
pub fn entity_id(kind: EntityKind, user_id: &str, existing_count: usize) -> String {
    format!("{}_{}_{}", kind.id_prefix(), user_id, existing_count)
}

impl Scenario {
    pub fn character_names(&self) -> Vec<&str> {
        self.characters.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn location_names(&self) -> Vec<&str> {
        self.locations.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Character => self.characters.len(),
            EntityKind::Location => self.locations.len(),
        }
    }

    /// Id the next entity of `kind` created for `user_id` receives.
    pub fn next_entity_id(&self, kind: EntityKind, user_id: &str) -> String {
        entity_id(kind, user_id, self.count(kind))
    }

    pub fn find_character(&self, name: &str) -> Option<usize> {
        self.characters
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn find_location(&self, name: &str) -> Option<usize> {
        self.locations
            .iter()
            .position(|l| l.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Copy of this scenario with `character` appended under a fresh id.
    pub fn with_character_added(&self, mut character: Character, user_id: &str) -> Scenario {
        character.id = self.next_entity_id(EntityKind::Character, user_id);
        let mut next = self.clone();
        next.characters.push(character);
        next
    }

    /// Copy of this scenario with `location` appended under a fresh id.
    pub fn with_location_added(&self, mut location: Location, user_id: &str) -> Scenario {
        location.id = self.next_entity_id(EntityKind::Location, user_id);
        let mut next = self.clone();
        next.locations.push(location);
        next
    }

    /// Copy with the character at `index` replaced. The original id is kept.
    pub fn with_character_replaced(&self, index: usize, mut character: Character) -> Option<Scenario> {
        let existing = self.characters.get(index)?;
        character.id = existing.id.clone();
        let mut next = self.clone();
        next.characters[index] = character;
        Some(next)
    }

    /// Copy with the location at `index` replaced. The original id is kept.
    pub fn with_location_replaced(&self, index: usize, mut location: Location) -> Option<Scenario> {
        let existing = self.locations.get(index)?;
        location.id = existing.id.clone();
        let mut next = self.clone();
        next.locations[index] = location;
        Some(next)
    }

    /// Give every character and location without an id a deterministic one.
    /// A repeated id is cleared and reassigned, so ids stay unique.
    pub fn assign_missing_ids(&mut self, user_id: &str) {
        let mut taken: HashSet<String> = HashSet::new();
        let ids = self
            .characters
            .iter_mut()
            .map(|c| &mut c.id)
            .chain(self.locations.iter_mut().map(|l| &mut l.id));
        for id in ids {
            if !id.is_empty() && !taken.insert(id.clone()) {
                id.clear();
            }
        }

        for i in 0..self.characters.len() {
            if self.characters[i].id.is_empty() {
                let id = free_id(EntityKind::Character, user_id, i, &taken);
                taken.insert(id.clone());
                self.characters[i].id = id;
            }
        }
        for i in 0..self.locations.len() {
            if self.locations[i].id.is_empty() {
                let id = free_id(EntityKind::Location, user_id, i, &taken);
                taken.insert(id.clone());
                self.locations[i].id = id;
            }
        }
    }

    /// After a whole-scenario rewrite, carry ids over from `previous` for
    /// entities that kept their name, then fill in the rest. Ids supplied for
    /// any other entity are dropped: only a name match keeps an old id.
    pub fn carry_ids_from(&mut self, previous: &Scenario, user_id: &str) {
        if self.id.is_none() {
            self.id = previous.id.clone();
        }
        let old_characters: Vec<(&str, &str)> = previous
            .characters
            .iter()
            .map(|c| (c.name.as_str(), c.id.as_str()))
            .collect();
        let old_locations: Vec<(&str, &str)> = previous
            .locations
            .iter()
            .map(|l| (l.name.as_str(), l.id.as_str()))
            .collect();

        carry(
            self.characters.iter_mut().map(|c| (c.name.as_str(), &mut c.id)),
            &old_characters,
        );
        carry(
            self.locations.iter_mut().map(|l| (l.name.as_str(), &mut l.id)),
            &old_locations,
        );
        self.assign_missing_ids(user_id);
    }

    /// Compact description used inside prompts.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        let title = if self.title.is_empty() {
            "(untitled)"
        } else {
            self.title.as_str()
        };
        lines.push(format!("Title: {title}"));
        if !self.synopsis.is_empty() {
            lines.push(format!("Synopsis: {}", self.synopsis));
        }
        if !self.characters.is_empty() {
            lines.push(format!("Characters: {}", self.character_names().join(", ")));
        }
        if !self.locations.is_empty() {
            lines.push(format!("Locations: {}", self.location_names().join(", ")));
        }
        lines.join("\n")
    }
}

/// Set each entity's id to the id of the unclaimed old entity with the same
/// name, or clear it.
fn carry<'a>(entities: impl Iterator<Item = (&'a str, &'a mut String)>, old: &[(&str, &str)]) {
    let mut claimed = vec![false; old.len()];
    for (name, id) in entities {
        let matched = old
            .iter()
            .enumerate()
            .find(|(i, (old_name, _))| !claimed[*i] && old_name.eq_ignore_ascii_case(name));
        match matched {
            Some((i, (_, old_id))) => {
                claimed[i] = true;
                *id = (*old_id).to_string();
            }
            None => id.clear(),
        }
    }
}

fn free_id(kind: EntityKind, user_id: &str, start: usize, taken: &HashSet<String>) -> String {
    let mut n = start;
    loop {
        let id = entity_id(kind, user_id, n);
        if !taken.contains(&id) {
            return id;
        }
        n += 1;
    }
}
