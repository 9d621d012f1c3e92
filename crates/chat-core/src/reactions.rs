use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Emoji → usernames who reacted with it, stored inline on the message row.
///
/// Writes replace the whole map, so two clients reacting at the same time can
/// overwrite each other's addition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ReactionMap(BTreeMap<String, Vec<String>>);

impl ReactionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Add `username` to the reactors of `emoji`. Returns `false` when already present.
    pub fn add(&mut self, emoji: &str, username: &str) -> bool {
        let users = self.0.entry(emoji.to_owned()).or_default();
        if users.iter().any(|user| user == username) {
            return false;
        }
        users.push(username.to_owned());
        true
    }

    pub fn users(&self, emoji: &str) -> &[String] {
        self.0.get(emoji).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_reacted(&self, emoji: &str, username: &str) -> bool {
        self.users(emoji).iter().any(|user| user == username)
    }

    /// Non-empty reactions with their reactor counts, in emoji order.
    pub fn counts(&self) -> Vec<(&str, usize)> {
        self.0
            .iter()
            .filter(|(_, users)| !users.is_empty())
            .map(|(emoji, users)| (emoji.as_str(), users.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_per_user() {
        let mut reactions = ReactionMap::new();
        assert!(reactions.add("👍", "@alice"));
        assert!(!reactions.add("👍", "@alice"));
        assert!(reactions.add("👍", "@bob"));

        assert_eq!(reactions.users("👍"), ["@alice", "@bob"]);
        assert!(reactions.has_reacted("👍", "@bob"));
        assert!(!reactions.has_reacted("🎉", "@bob"));
    }

    #[test]
    fn counts_skip_empty_entries() {
        let reactions: ReactionMap =
            serde_json::from_str(r#"{"🎉":[],"👍":["@a","@b"]}"#).expect("decode");
        assert_eq!(reactions.counts(), vec![("👍", 2)]);
        assert!(!reactions.is_empty());
    }
}
