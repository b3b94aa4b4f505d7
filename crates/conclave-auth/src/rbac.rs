use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use conclave_types::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    AgentsSpawn,
    AgentsManage,
    AgentsView,
    MemoryRead,
    MemoryWrite,
    SessionsManage,
    SessionsView,
    ConfigView,
    ConfigManage,
    ProvidersView,
    ProvidersManage,
    AuditView,
    AuditExport,
    UsersManage,
}

impl Permission {
    pub const ALL: [Permission; 14] = [
        Permission::AgentsSpawn,
        Permission::AgentsManage,
        Permission::AgentsView,
        Permission::MemoryRead,
        Permission::MemoryWrite,
        Permission::SessionsManage,
        Permission::SessionsView,
        Permission::ConfigView,
        Permission::ConfigManage,
        Permission::ProvidersView,
        Permission::ProvidersManage,
        Permission::AuditView,
        Permission::AuditExport,
        Permission::UsersManage,
    ];

    /// Permissions the owner override never grants.
    fn admin_only(self) -> bool {
        matches!(
            self,
            Permission::ConfigManage
                | Permission::ProvidersManage
                | Permission::AuditExport
                | Permission::UsersManage
        )
    }
}

/// The fixed default table. Admin gets everything; Operator runs agents and
/// sessions; Viewer is read-only.
fn role_grants(role: Role, permission: Permission) -> bool {
    match role {
        Role::Admin => true,
        Role::Operator => matches!(
            permission,
            Permission::AgentsSpawn
                | Permission::AgentsManage
                | Permission::AgentsView
                | Permission::MemoryRead
                | Permission::MemoryWrite
                | Permission::SessionsManage
                | Permission::SessionsView
                | Permission::ConfigView
                | Permission::ProvidersView
        ),
        Role::Viewer => matches!(
            permission,
            Permission::AgentsView
                | Permission::SessionsView
                | Permission::ConfigView
                | Permission::ProvidersView
                | Permission::MemoryRead
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Agent,
    Session,
    Memory,
    Config,
    Provider,
    Audit,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Create,
    Delete,
    Manage,
    Export,
}

fn required_permission(resource: ResourceType, action: Action) -> Permission {
    match (resource, action) {
        (ResourceType::Agent, Action::Read) => Permission::AgentsView,
        (ResourceType::Agent, Action::Create) => Permission::AgentsSpawn,
        (ResourceType::Agent, _) => Permission::AgentsManage,
        (ResourceType::Session, Action::Read) => Permission::SessionsView,
        (ResourceType::Session, _) => Permission::SessionsManage,
        (ResourceType::Memory, Action::Read) => Permission::MemoryRead,
        (ResourceType::Memory, _) => Permission::MemoryWrite,
        (ResourceType::Config, Action::Read) => Permission::ConfigView,
        (ResourceType::Config, _) => Permission::ConfigManage,
        (ResourceType::Provider, Action::Read) => Permission::ProvidersView,
        (ResourceType::Provider, _) => Permission::ProvidersManage,
        (ResourceType::Audit, Action::Export) => Permission::AuditExport,
        (ResourceType::Audit, _) => Permission::AuditView,
        (ResourceType::User, _) => Permission::UsersManage,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub role: Role,
    #[serde(default)]
    pub custom_grants: HashSet<Permission>,
}

/// User registry with role resolution and explicit grants.
pub struct RbacStore {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl RbacStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn upsert_user(&self, user_id: impl Into<String>, role: Role) {
        let user_id = user_id.into();
        self.users.write().expect("rbac poisoned").insert(
            user_id.clone(),
            UserRecord {
                user_id,
                role,
                custom_grants: HashSet::new(),
            },
        );
    }

    pub fn get_user(&self, user_id: &str) -> Option<UserRecord> {
        self.users
            .read()
            .expect("rbac poisoned")
            .get(user_id)
            .cloned()
    }

    pub fn has_permission(&self, user_id: &str, permission: Permission) -> bool {
        let users = self.users.read().expect("rbac poisoned");
        let Some(user) = users.get(user_id) else {
            return false;
        };
        role_grants(user.role, permission) || user.custom_grants.contains(&permission)
    }

    pub fn grant(&self, user_id: &str, permission: Permission) -> Result<()> {
        let mut users = self.users.write().expect("rbac poisoned");
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("user `{user_id}`")))?;
        user.custom_grants.insert(permission);
        Ok(())
    }

    pub fn revoke(&self, user_id: &str, permission: Permission) -> Result<()> {
        let mut users = self.users.write().expect("rbac poisoned");
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("user `{user_id}`")))?;
        user.custom_grants.remove(&permission);
        Ok(())
    }

    /// Resource/action check with the owner override: a resource owner may
    /// perform non-admin operations on it without the mapped permission.
    pub fn check_resource_action(
        &self,
        user_id: &str,
        resource: ResourceType,
        action: Action,
        _resource_id: Option<&str>,
        owner_id: Option<&str>,
    ) -> Result<()> {
        let permission = required_permission(resource, action);
        if self.has_permission(user_id, permission) {
            return Ok(());
        }
        if let Some(owner) = owner_id {
            if owner == user_id && !permission.admin_only() {
                return Ok(());
            }
        }
        Err(Error::Forbidden(format!(
            "user `{user_id}` lacks {permission:?} for {resource:?}/{action:?}"
        )))
    }

    /// Role changes are Admin-only, and the last Admin cannot be demoted.
    pub fn set_role(&self, actor_id: &str, target_id: &str, role: Role) -> Result<()> {
        let mut users = self.users.write().expect("rbac poisoned");
        let actor_is_admin = users
            .get(actor_id)
            .map(|u| u.role == Role::Admin)
            .unwrap_or(false);
        if !actor_is_admin {
            return Err(Error::Forbidden(format!(
                "only an admin may change roles; `{actor_id}` is not one"
            )));
        }
        let target = users
            .get(target_id)
            .ok_or_else(|| Error::NotFound(format!("user `{target_id}`")))?;
        if target.role == Role::Admin && role != Role::Admin {
            let admin_count = users.values().filter(|u| u.role == Role::Admin).count();
            if admin_count <= 1 {
                return Err(Error::InvalidState(
                    "cannot demote the last admin".to_string(),
                ));
            }
        }
        users.get_mut(target_id).expect("checked above").role = role;
        Ok(())
    }
}

impl Default for RbacStore {
    fn default() -> Self {
        Self::new()
    }
}
