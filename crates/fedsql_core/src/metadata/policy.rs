use std::collections::HashMap;
use std::fmt;

/// Action being performed against a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionAction {
    Read,
    Create,
    Update,
    Delete,
    Execute,
}

impl fmt::Display for PermissionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "READ",
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Execute => "EXECUTE",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permission {
    pub read: bool,
    pub create: bool,
    pub update: bool,
    pub delete: bool,
    pub execute: bool,
}

impl Permission {
    pub const ALL: Permission = Permission {
        read: true,
        create: true,
        update: true,
        delete: true,
        execute: true,
    };

    pub const READ_ONLY: Permission = Permission {
        read: true,
        create: false,
        update: false,
        delete: false,
        execute: false,
    };

    pub fn allows(&self, action: PermissionAction) -> bool {
        match action {
            PermissionAction::Read => self.read,
            PermissionAction::Create => self.create,
            PermissionAction::Update => self.update,
            PermissionAction::Delete => self.delete,
            PermissionAction::Execute => self.execute,
        }
    }
}

/// Named role granting permissions on resources.
///
/// A permission on a model applies to everything in that model unless the
/// resource has a more specific entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPolicy {
    pub name: String,
    /// Users this role is mapped to.
    pub users: Vec<String>,
    /// Granted to every authenticated user.
    pub any_authenticated: bool,
    permissions: HashMap<String, Permission>,
}

impl DataPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        DataPolicy {
            name: name.into(),
            users: Vec::new(),
            any_authenticated: false,
            permissions: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.users.push(user.into());
        self
    }

    pub fn for_any_authenticated(mut self) -> Self {
        self.any_authenticated = true;
        self
    }

    pub fn with_permission(mut self, resource: &str, permission: Permission) -> Self {
        self.permissions.insert(resource.to_lowercase(), permission);
        self
    }

    pub fn applies_to(&self, user: &str) -> bool {
        self.any_authenticated || self.users.iter().any(|u| u.eq_ignore_ascii_case(user))
    }

    /// Find the most specific permission for a resource by walking up its
    /// qualified name.
    pub fn permission_for(&self, resource: &str) -> Option<&Permission> {
        let mut name = resource.to_lowercase();
        loop {
            if let Some(perm) = self.permissions.get(&name) {
                return Some(perm);
            }
            match name.rfind('.') {
                Some(idx) => name.truncate(idx),
                None => return None,
            }
        }
    }

    pub fn allows(&self, resource: &str, action: PermissionAction) -> bool {
        self.permission_for(resource)
            .map(|p| p.allows(action))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_specific_permission_wins() {
        let policy = DataPolicy::new("readers")
            .with_permission("pm1", Permission::ALL)
            .with_permission("pm1.secret", Permission::default());

        assert!(policy.allows("PM1.g1", PermissionAction::Delete));
        assert!(!policy.allows("pm1.secret", PermissionAction::Read));
        assert!(!policy.allows("pm2.g1", PermissionAction::Read));
    }

    #[test]
    fn user_mapping() {
        let policy = DataPolicy::new("r").with_user("Alice");
        assert!(policy.applies_to("alice"));
        assert!(!policy.applies_to("bob"));
        assert!(DataPolicy::new("all").for_any_authenticated().applies_to("bob"));
    }
}
