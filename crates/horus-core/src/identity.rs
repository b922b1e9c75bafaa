//! Device-token to person resolution.
//!
//! A device reports punches under an opaque token (usually the enrollment
//! number). [`IdentityIndex`] maps tokens to [`PersonProfile`]s in three
//! tiers, first match wins:
//!
//! 1. exact `device_user_id`
//! 2. case-insensitive `device_name`
//! 3. case-insensitive `display_name`
//!
//! Within a tier the first profile in input order wins. Tokens are trimmed
//! and a blank token never resolves.

use std::collections::HashMap;

use crate::storage::directory::PersonProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    DeviceUserId,
    DeviceName,
    DisplayName,
}

/// Lookup tables built once per sync run.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    profiles: Vec<PersonProfile>,
    by_device_user_id: HashMap<String, usize>,
    by_device_name: HashMap<String, usize>,
    by_display_name: HashMap<String, usize>,
}

fn name_key(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_lowercase())
}

fn id_key(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl IdentityIndex {
    pub fn build(profiles: impl IntoIterator<Item = PersonProfile>) -> Self {
        let mut index = Self::default();
        for profile in profiles {
            index.insert(profile);
        }
        index
    }

    /// Add a profile. Existing keys keep their earlier owner.
    pub fn insert(&mut self, profile: PersonProfile) {
        let slot = self.profiles.len();
        if let Some(key) = profile.device_user_id.as_deref().and_then(id_key) {
            self.by_device_user_id.entry(key).or_insert(slot);
        }
        if let Some(key) = profile.device_name.as_deref().and_then(name_key) {
            self.by_device_name.entry(key).or_insert(slot);
        }
        if let Some(key) = name_key(&profile.display_name) {
            self.by_display_name.entry(key).or_insert(slot);
        }
        self.profiles.push(profile);
    }

    pub fn resolve(&self, token: &str) -> Option<&PersonProfile> {
        self.resolve_with_tier(token).map(|(profile, _)| profile)
    }

    /// Resolve and report which tier matched.
    pub fn resolve_with_tier(&self, token: &str) -> Option<(&PersonProfile, MatchTier)> {
        let exact = id_key(token)?;
        if let Some(&slot) = self.by_device_user_id.get(&exact) {
            return Some((&self.profiles[slot], MatchTier::DeviceUserId));
        }
        let folded = exact.to_lowercase();
        if let Some(&slot) = self.by_device_name.get(&folded) {
            return Some((&self.profiles[slot], MatchTier::DeviceName));
        }
        self.by_display_name
            .get(&folded)
            .map(|&slot| (&self.profiles[slot], MatchTier::DisplayName))
    }

    /// Whether `device_user_id` is already claimed by a profile.
    pub fn knows_device_user(&self, device_user_id: &str) -> bool {
        id_key(device_user_id).is_some_and(|key| self.by_device_user_id.contains_key(&key))
    }

    pub fn profiles(&self) -> &[PersonProfile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
