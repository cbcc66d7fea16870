//! Identity types shared with the authentication collaborator.

use serde::{Deserialize, Serialize};

/// Username and password used against the remote store.
#[derive(derive_more::Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Login name.
    pub username: String,
    /// Password, never logged.
    #[debug("***")]
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Profile of a user, cached so the local store can be opened while offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Login name.
    pub name: String,
    /// Roles granted by the server.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Name shown in the UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Name of the association store assigned to the user.
    pub database: String,
}

/// A user as emitted by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Credentials for the remote store.
    pub credentials: Credentials,
    /// Last known profile.
    pub profile: Profile,
}

impl AuthenticatedUser {
    /// Creates a user with an empty role set.
    pub fn new(credentials: Credentials, database: impl Into<String>) -> Self {
        let profile = Profile {
            name: credentials.username.clone(),
            roles: Vec::new(),
            display_name: None,
            database: database.into(),
        };
        Self {
            credentials,
            profile,
        }
    }

    /// Login name.
    pub fn username(&self) -> &str {
        &self.credentials.username
    }
}

/// The user context of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Login name.
    pub name: String,
    /// Roles of the session user.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// A `_users` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDoc {
    /// Login name.
    pub name: String,
    /// Roles of the user.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Extra profile fields, e.g. the display name and assigned store.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl UserDoc {
    /// Id of the `_users` document for `name`.
    pub fn doc_id(name: &str) -> String {
        format!("org.couchdb.user:{name}")
    }

    /// Builds the profile of this user for the given store name.
    pub fn profile(&self, database: impl Into<String>) -> Profile {
        Profile {
            name: self.name.clone(),
            roles: self.roles.clone(),
            display_name: self
                .fields
                .get("display_name")
                .and_then(|v| v.as_str())
                .map(ToOwned::to_owned),
            database: database.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_not_logged() {
        let creds = Credentials::new("alice", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn user_doc_profile() {
        let doc: UserDoc = serde_json::from_value(serde_json::json!({
            "name": "alice",
            "roles": ["member"],
            "display_name": "Alice",
            "type": "user",
        }))
        .unwrap();
        let profile = doc.profile("assoc");
        assert_eq!(profile.display_name.as_deref(), Some("Alice"));
        assert_eq!(profile.roles, vec!["member".to_string()]);
        assert_eq!(UserDoc::doc_id("alice"), "org.couchdb.user:alice");
    }
}
