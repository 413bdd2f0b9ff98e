//! User and managed-profile lookup

use std::collections::HashMap;

use iris_core::UserId;

/// Source of truth for users and their profile relationships
pub trait UserDirectory: Send + Sync {
    /// Every user on the device
    fn users(&self) -> Vec<UserId>;

    /// The foreground user at startup
    fn current_user(&self) -> UserId;

    /// Whether `user_id` is a managed (work) profile
    fn is_managed_profile(&self, user_id: UserId) -> bool;

    /// User whose credential unlocks `user_id`
    fn credential_owner(&self, user_id: UserId) -> UserId;

    /// Group a caller operates on: a managed profile keeps its own group
    /// unless the caller is the lock screen
    fn effective_group(&self, user_id: UserId, owner: Option<&str>, keyguard_owner: &str) -> UserId {
        let is_keyguard = owner == Some(keyguard_owner);
        if !is_keyguard && self.is_managed_profile(user_id) {
            user_id
        } else {
            self.credential_owner(user_id)
        }
    }
}

/// Fixed user table
#[derive(Debug, Clone)]
pub struct StaticUserDirectory {
    current: UserId,
    users: Vec<UserId>,
    /// Managed profile -> owning user
    profiles: HashMap<UserId, UserId>,
}

impl StaticUserDirectory {
    /// Directory with one user
    pub fn single(user_id: UserId) -> Self {
        Self {
            current: user_id,
            users: vec![user_id],
            profiles: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        if !self.users.contains(&user_id) {
            self.users.push(user_id);
        }
        self
    }

    /// Add a managed profile owned by `owner`
    pub fn with_profile(mut self, profile: UserId, owner: UserId) -> Self {
        self = self.with_user(profile);
        self.profiles.insert(profile, owner);
        self
    }
}

impl UserDirectory for StaticUserDirectory {
    fn users(&self) -> Vec<UserId> {
        self.users.clone()
    }

    fn current_user(&self) -> UserId {
        self.current
    }

    fn is_managed_profile(&self, user_id: UserId) -> bool {
        self.profiles.contains_key(&user_id)
    }

    fn credential_owner(&self, user_id: UserId) -> UserId {
        self.profiles.get(&user_id).copied().unwrap_or(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_group() {
        let users = StaticUserDirectory::single(0).with_profile(10, 0);

        assert_eq!(users.effective_group(0, None, "keyguard"), 0);
        assert_eq!(users.effective_group(10, Some("settings"), "keyguard"), 10);
        assert_eq!(users.effective_group(10, Some("keyguard"), "keyguard"), 0);
    }

    #[test]
    fn test_profiles() {
        let users = StaticUserDirectory::single(0)
            .with_profile(10, 0)
            .with_user(11);

        assert!(users.is_managed_profile(10));
        assert!(!users.is_managed_profile(11));
        assert_eq!(users.credential_owner(10), 0);
        assert_eq!(users.credential_owner(11), 11);
        assert_eq!(users.users(), vec![0, 10, 11]);
    }
}
