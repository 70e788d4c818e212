//! Thread-safe in-memory user database.
//!
//! Grounded in `original_source/src/users/users.c` and `admin_commands.c`:
//! a fixed set of operations (`authenticate`, `add`, `delete`,
//! `change_password`, `change_role`, `list`) plus per-user running counters
//! updated as connections proxy data. Guarded by a single `Mutex` since every
//! operation touches the whole map rather than one independent field.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// A user's privilege level. Gates the admin-only management commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// A single user record.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub password: String,
    pub active: bool,
    pub role: Role,
    pub bytes_transferred: u64,
    pub total_connections: u64,
    pub last_connection: Option<DateTime<Utc>>,
}

impl UserRecord {
    fn new(username: String, password: String, role: Role) -> Self {
        UserRecord {
            username,
            password,
            active: true,
            role,
            bytes_transferred: 0,
            total_connections: 0,
            last_connection: None,
        }
    }
}

/// Process-wide user store, initialised once at startup and held for the
/// process lifetime.
pub struct UserStore {
    users: Mutex<HashMap<String, UserRecord>>,
}

impl UserStore {
    pub fn new() -> Self {
        UserStore {
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Check a username/password pair against an active user record.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let users = self.users.lock().unwrap();
        users
            .get(username)
            .map(|u| u.active && u.password == password)
            .unwrap_or(false)
    }

    /// Whether `username` is a known, active admin.
    pub fn is_admin(&self, username: &str) -> bool {
        let users = self.users.lock().unwrap();
        users
            .get(username)
            .map(|u| u.active && u.role == Role::Admin)
            .unwrap_or(false)
    }

    /// Add a new user. Returns `false` if the username is already taken.
    pub fn add(&self, username: &str, password: &str, role: Role) -> bool {
        let mut users = self.users.lock().unwrap();
        if users.contains_key(username) {
            return false;
        }
        users.insert(
            username.to_string(),
            UserRecord::new(username.to_string(), password.to_string(), role),
        );
        true
    }

    /// Remove a user. Returns `false` if the user didn't exist.
    pub fn delete(&self, username: &str) -> bool {
        self.users.lock().unwrap().remove(username).is_some()
    }

    /// Change a user's password. Returns `false` if the user didn't exist.
    pub fn change_password(&self, username: &str, new_password: &str) -> bool {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(username) {
            Some(u) => {
                u.password = new_password.to_string();
                true
            }
            None => false,
        }
    }

    /// Change a user's role. Returns `false` if the user didn't exist.
    pub fn change_role(&self, username: &str, role: Role) -> bool {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(username) {
            Some(u) => {
                u.role = role;
                true
            }
            None => false,
        }
    }

    /// Snapshot of all users, for the management `LIST_USERS` command.
    pub fn list(&self) -> Vec<UserRecord> {
        self.users.lock().unwrap().values().cloned().collect()
    }

    /// Number of known users.
    pub fn count(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    /// Record that `username` relayed `bytes` and completed a connection.
    pub fn update_metrics(&self, username: &str, bytes: u64) {
        let mut users = self.users.lock().unwrap();
        if let Some(u) = users.get_mut(username) {
            u.bytes_transferred += bytes;
            u.total_connections += 1;
            u.last_connection = Some(Utc::now());
        }
    }
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_authenticate() {
        let store = UserStore::new();
        assert!(store.add("alice", "secret", Role::User));
        assert!(store.authenticate("alice", "secret"));
        assert!(!store.authenticate("alice", "wrong"));
        assert!(!store.authenticate("bob", "secret"));
    }

    #[test]
    fn test_add_duplicate_fails() {
        let store = UserStore::new();
        assert!(store.add("alice", "secret", Role::User));
        assert!(!store.add("alice", "other", Role::User));
    }

    #[test]
    fn test_delete() {
        let store = UserStore::new();
        store.add("alice", "secret", Role::User);
        assert!(store.delete("alice"));
        assert!(!store.authenticate("alice", "secret"));
        assert!(!store.delete("alice"));
    }

    #[test]
    fn test_change_password() {
        let store = UserStore::new();
        store.add("alice", "secret", Role::User);
        assert!(store.change_password("alice", "newpass"));
        assert!(store.authenticate("alice", "newpass"));
        assert!(!store.authenticate("alice", "secret"));
    }

    #[test]
    fn test_roles_and_admin_check() {
        let store = UserStore::new();
        store.add("alice", "secret", Role::User);
        store.add("root", "toor", Role::Admin);
        assert!(!store.is_admin("alice"));
        assert!(store.is_admin("root"));
        assert!(store.change_role("alice", Role::Admin));
        assert!(store.is_admin("alice"));
    }

    #[test]
    fn test_update_metrics() {
        let store = UserStore::new();
        store.add("alice", "secret", Role::User);
        store.update_metrics("alice", 1024);
        store.update_metrics("alice", 512);

        let record = store.list().into_iter().find(|u| u.username == "alice").unwrap();
        assert_eq!(record.bytes_transferred, 1536);
        assert_eq!(record.total_connections, 2);
        assert!(record.last_connection.is_some());
    }
}
