//! Permission model — capability sets, profiles, and the profile registry.
//!
//! A [`PermissionSet`] maps named capabilities to boolean grants; absent keys
//! read as `false`. A [`PermissionProfile`] is a named, reusable grant set.
//! Built-in profiles are seeded at startup and immutable; custom profiles are
//! created by cloning a base profile and belong to the host user that made
//! them.
//!
//! ## Concurrency
//!
//! The profile map is behind an `RwLock`. `create_custom` holds the write
//! lock across the duplicate-name check and insert to prevent TOCTOU races.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::unattended::UnattendedPolicy;

/// A single remote-control capability that a profile can grant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    Keyboard,
    Mouse,
    Clipboard,
    FileTransfer,
    FileManager,
    SystemInfo,
    Restart,
    RecordSession,
    RemotePrint,
    Whiteboard,
    TcpTunneling,
    PrivacyMode,
    LockOnDisconnect,
    ShowRemotePointer,
    RestrictedView,
    LockLocalInput,
    Audio,
}

impl Capability {
    /// Every known capability, in declaration order.
    pub const ALL: [Capability; 17] = [
        Capability::Keyboard,
        Capability::Mouse,
        Capability::Clipboard,
        Capability::FileTransfer,
        Capability::FileManager,
        Capability::SystemInfo,
        Capability::Restart,
        Capability::RecordSession,
        Capability::RemotePrint,
        Capability::Whiteboard,
        Capability::TcpTunneling,
        Capability::PrivacyMode,
        Capability::LockOnDisconnect,
        Capability::ShowRemotePointer,
        Capability::RestrictedView,
        Capability::LockLocalInput,
        Capability::Audio,
    ];

    /// The camelCase wire name, as it appears in JSON permission maps.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Keyboard => "keyboard",
            Capability::Mouse => "mouse",
            Capability::Clipboard => "clipboard",
            Capability::FileTransfer => "fileTransfer",
            Capability::FileManager => "fileManager",
            Capability::SystemInfo => "systemInfo",
            Capability::Restart => "restart",
            Capability::RecordSession => "recordSession",
            Capability::RemotePrint => "remotePrint",
            Capability::Whiteboard => "whiteboard",
            Capability::TcpTunneling => "tcpTunneling",
            Capability::PrivacyMode => "privacyMode",
            Capability::LockOnDisconnect => "lockOnDisconnect",
            Capability::ShowRemotePointer => "showRemotePointer",
            Capability::RestrictedView => "restrictedView",
            Capability::LockLocalInput => "lockLocalInput",
            Capability::Audio => "audio",
        }
    }
}

/// A mapping of capabilities to boolean grants. Absent keys default to `false`.
///
/// Serializes as a flat JSON object (`{"keyboard": true, "clipboard": false}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeMap<Capability, bool>);

impl PermissionSet {
    /// A set with no grants.
    pub fn none() -> Self {
        Self::default()
    }

    /// A set granting every known capability.
    pub fn all() -> Self {
        Self(Capability::ALL.iter().map(|c| (*c, true)).collect())
    }

    /// Builder-style grant of a single capability.
    #[must_use]
    pub fn with(mut self, cap: Capability) -> Self {
        self.0.insert(cap, true);
        self
    }

    /// Whether the capability is granted. Absent keys are `false`.
    pub fn grants(&self, cap: Capability) -> bool {
        self.0.get(&cap).copied().unwrap_or(false)
    }

    /// Set a single grant in place.
    pub fn set(&mut self, cap: Capability, granted: bool) {
        self.0.insert(cap, granted);
    }
}

/// A named, reusable capability-grant set applied to sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub permissions: PermissionSet,
    pub is_built_in: bool,
    pub is_enabled: bool,
    pub is_unattended_access: bool,
    /// Unattended-access policy (password hash, allow-list, schedule).
    /// Never serialized out — the hash is opaque to the API.
    #[serde(skip)]
    pub unattended: Option<UnattendedPolicy>,
    /// Host user that owns this profile. `None` for built-ins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// A capability request is granted iff the profile is enabled and the
/// capability is `true` in its set.
pub fn resolve(profile: &PermissionProfile, cap: Capability) -> bool {
    profile.is_enabled && profile.permissions.grants(cap)
}

/// Errors from profile CRUD operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    /// Empty name, or a duplicate within the owner's scope.
    #[error("profile name is empty or already taken")]
    InvalidName,
    /// Built-in profiles reject any mutation or deletion.
    #[error("built-in profiles cannot be modified")]
    ImmutableProfile,
    #[error("profile {0} not found")]
    NotFound(String),
}

/// Partial update applied by [`ProfileRegistry::update`]. `None` fields are
/// left untouched.
#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub description: Option<String>,
    pub permissions: Option<PermissionSet>,
    pub is_enabled: Option<bool>,
    pub is_unattended_access: Option<bool>,
    pub unattended: Option<Option<UnattendedPolicy>>,
}

/// The single authority for permission profiles.
///
/// Cloneable — all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone)]
pub struct ProfileRegistry {
    profiles: Arc<RwLock<HashMap<String, PermissionProfile>>>,
}

fn builtin(id: &str, name: &str, description: &str, permissions: PermissionSet) -> PermissionProfile {
    PermissionProfile {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        permissions,
        is_built_in: true,
        is_enabled: true,
        is_unattended_access: false,
        unattended: None,
        owner: None,
    }
}

impl ProfileRegistry {
    /// Create a registry seeded with the built-in profiles.
    pub fn with_builtins() -> Self {
        let mut profiles = HashMap::new();
        for profile in [
            builtin(
                "full-access",
                "Full Access",
                "Complete control of the remote desktop",
                PermissionSet::all(),
            ),
            builtin(
                "screen-sharing",
                "Screen Sharing",
                "View the screen and see the remote pointer",
                PermissionSet::none().with(Capability::ShowRemotePointer),
            ),
            builtin(
                "view-only",
                "View Only",
                "Watch the session without interacting",
                PermissionSet::none(),
            ),
        ] {
            profiles.insert(profile.id.clone(), profile);
        }
        Self {
            profiles: Arc::new(RwLock::new(profiles)),
        }
    }

    pub async fn get(&self, id: &str) -> Option<PermissionProfile> {
        self.profiles.read().await.get(id).cloned()
    }

    /// All profiles, built-ins first, then by name.
    pub async fn list(&self) -> Vec<PermissionProfile> {
        let profiles = self.profiles.read().await;
        let mut items: Vec<PermissionProfile> = profiles.values().cloned().collect();
        items.sort_by(|a, b| {
            b.is_built_in
                .cmp(&a.is_built_in)
                .then_with(|| a.name.cmp(&b.name))
        });
        items
    }

    /// Clone a base profile into a new custom profile owned by `owner`.
    ///
    /// Holds the write lock through the duplicate-name check and insert.
    pub async fn create_custom(
        &self,
        name: &str,
        base_id: &str,
        owner: Option<&str>,
    ) -> Result<PermissionProfile, ProfileError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ProfileError::InvalidName);
        }

        let mut profiles = self.profiles.write().await;

        let duplicate = profiles
            .values()
            .any(|p| p.name == name && p.owner.as_deref() == owner);
        if duplicate {
            return Err(ProfileError::InvalidName);
        }

        let base = profiles
            .get(base_id)
            .ok_or_else(|| ProfileError::NotFound(base_id.to_string()))?;

        let profile = PermissionProfile {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: format!("Based on {}", base.name),
            permissions: base.permissions.clone(),
            is_built_in: false,
            is_enabled: true,
            is_unattended_access: false,
            unattended: None,
            owner: owner.map(ToString::to_string),
        };
        profiles.insert(profile.id.clone(), profile.clone());

        info!("Profile {} created (base {base_id})", profile.id);
        Ok(profile)
    }

    /// Apply a partial update. Built-ins reject all mutation.
    pub async fn update(
        &self,
        id: &str,
        update: ProfileUpdate,
    ) -> Result<PermissionProfile, ProfileError> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .get_mut(id)
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;
        if profile.is_built_in {
            return Err(ProfileError::ImmutableProfile);
        }

        if let Some(description) = update.description {
            profile.description = description;
        }
        if let Some(permissions) = update.permissions {
            profile.permissions = permissions;
        }
        if let Some(enabled) = update.is_enabled {
            profile.is_enabled = enabled;
        }
        if let Some(unattended_access) = update.is_unattended_access {
            profile.is_unattended_access = unattended_access;
        }
        if let Some(policy) = update.unattended {
            profile.unattended = policy;
        }

        Ok(profile.clone())
    }

    /// Remove a custom profile. The caller is responsible for checking that
    /// no live session is bound to it first.
    pub async fn delete(&self, id: &str) -> Result<(), ProfileError> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .get(id)
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;
        if profile.is_built_in {
            return Err(ProfileError::ImmutableProfile);
        }
        profiles.remove(id);
        info!("Profile {id} deleted");
        Ok(())
    }

    pub async fn profile_count(&self) -> usize {
        self.profiles.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_capability_defaults_false() {
        let set = PermissionSet::none().with(Capability::Keyboard);
        assert!(set.grants(Capability::Keyboard));
        assert!(!set.grants(Capability::TcpTunneling));
    }

    #[test]
    fn test_resolve_false_when_disabled() {
        let mut profile = builtin("t", "t", "", PermissionSet::all());
        assert!(resolve(&profile, Capability::Clipboard));
        profile.is_enabled = false;
        assert!(!resolve(&profile, Capability::Clipboard));
    }

    #[tokio::test]
    async fn test_create_custom_copies_base_permissions() {
        let registry = ProfileRegistry::with_builtins();
        let base = registry.get("screen-sharing").await.unwrap();

        let custom = registry
            .create_custom("X", "screen-sharing", Some("alice"))
            .await
            .unwrap();
        assert!(!custom.is_built_in);
        assert_eq!(custom.permissions, base.permissions);

        let read_back = registry.get(&custom.id).await.unwrap();
        assert_eq!(read_back.permissions, base.permissions);
        assert!(!read_back.is_built_in);
    }

    #[tokio::test]
    async fn test_create_custom_rejects_bad_names() {
        let registry = ProfileRegistry::with_builtins();
        assert_eq!(
            registry.create_custom("  ", "view-only", None).await.unwrap_err(),
            ProfileError::InvalidName
        );

        registry
            .create_custom("Support", "view-only", Some("alice"))
            .await
            .unwrap();
        // Duplicate within the same owner scope is rejected...
        assert_eq!(
            registry
                .create_custom("Support", "view-only", Some("alice"))
                .await
                .unwrap_err(),
            ProfileError::InvalidName
        );
        // ...but another owner may reuse the name.
        assert!(registry
            .create_custom("Support", "view-only", Some("bob"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_builtins_are_immutable() {
        let registry = ProfileRegistry::with_builtins();
        let err = registry
            .update("full-access", ProfileUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err, ProfileError::ImmutableProfile);
        assert_eq!(
            registry.delete("view-only").await.unwrap_err(),
            ProfileError::ImmutableProfile
        );
    }

    #[tokio::test]
    async fn test_update_custom_profile() {
        let registry = ProfileRegistry::with_builtins();
        let custom = registry
            .create_custom("Ops", "view-only", None)
            .await
            .unwrap();

        let mut permissions = custom.permissions.clone();
        permissions.set(Capability::Clipboard, true);
        let updated = registry
            .update(
                &custom.id,
                ProfileUpdate {
                    permissions: Some(permissions),
                    is_enabled: Some(false),
                    ..ProfileUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.permissions.grants(Capability::Clipboard));
        // Disabled profiles resolve nothing, whatever the stored grants say.
        assert!(!resolve(&updated, Capability::Clipboard));
    }
}
