use std::collections::BTreeSet;
use std::fmt::Debug;

use fedsql_error::{DbError, DbErrorKind, Result};

use super::command::{Command, CommandKind};
use crate::metadata::QueryMetadata;
use crate::metadata::policy::PermissionAction;

/// Checks that a user may execute a command.
pub trait AuthorizationValidator: Debug + Sync + Send {
    /// Errors with every inaccessible object, not just the first found.
    fn validate_access(
        &self,
        user: &str,
        command: &Command,
        metadata: &dyn QueryMetadata,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllValidator;

impl AuthorizationValidator for AllowAllValidator {
    fn validate_access(&self, _: &str, _: &Command, _: &dyn QueryMetadata) -> Result<()> {
        Ok(())
    }
}

/// Validates against the VDB's data policies mapped to the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataRoleValidator;

impl DataRoleValidator {
    fn action_for(kind: CommandKind) -> PermissionAction {
        match kind {
            CommandKind::Query => PermissionAction::Read,
            CommandKind::Insert | CommandKind::Create => PermissionAction::Create,
            CommandKind::Update => PermissionAction::Update,
            CommandKind::Delete | CommandKind::Drop => PermissionAction::Delete,
            CommandKind::Procedure => PermissionAction::Execute,
        }
    }
}

impl AuthorizationValidator for DataRoleValidator {
    fn validate_access(
        &self,
        user: &str,
        command: &Command,
        metadata: &dyn QueryMetadata,
    ) -> Result<()> {
        let policies: Vec<_> = metadata
            .data_policies()
            .iter()
            .filter(|p| p.applies_to(user))
            .collect();

        let mut inaccessible = BTreeSet::new();
        let mut check = |resource: &str, action: PermissionAction| {
            if !policies.iter().any(|p| p.allows(resource, action)) {
                inaccessible.insert(resource.to_string());
            }
        };

        let action = Self::action_for(command.kind);
        for (idx, group) in command.groups.iter().enumerate() {
            // Only the target of a modification needs the write permission,
            // everything else is read.
            let action = if idx == 0 { action } else { PermissionAction::Read };
            check(group, action);
        }
        for procedure in &command.procedures {
            check(procedure, PermissionAction::Execute);
        }

        if inaccessible.is_empty() {
            return Ok(());
        }

        let objects = inaccessible.into_iter().collect::<Vec<_>>().join(", ");
        Err(DbError::with_kind(
            DbErrorKind::Authorization,
            format!("User '{user}' is not entitled to action <{action}> for {objects}"),
        )
        .with_field("user", user.to_string())
        .with_field("objects", objects))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::policy::{DataPolicy, Permission};
    use crate::metadata::{Vdb, VdbMetadata};

    fn metadata() -> VdbMetadata {
        VdbMetadata::new(
            Vdb::new("vdb", 1)
                .with_model("pm1", true, Some("source1"))
                .with_data_policy(
                    DataPolicy::new("readers")
                        .with_user("alice")
                        .with_permission("pm1.g1", Permission::READ_ONLY),
                ),
        )
    }

    fn query(groups: &[&str]) -> Command {
        let mut cmd = Command::new("select", CommandKind::Query);
        cmd.groups = groups.iter().map(|s| s.to_string()).collect();
        cmd
    }

    #[test]
    fn allowed() {
        DataRoleValidator
            .validate_access("alice", &query(&["pm1.g1"]), &metadata())
            .unwrap();
    }

    #[test]
    fn enumerates_every_inaccessible_object() {
        let err = DataRoleValidator
            .validate_access("alice", &query(&["pm1.g1", "pm1.g2", "pm1.g3"]), &metadata())
            .unwrap_err();

        assert_eq!(DbErrorKind::Authorization, err.kind());
        assert_eq!(Some("pm1.g2, pm1.g3"), err.field("objects"));
    }

    #[test]
    fn write_needs_permission() {
        let mut cmd = Command::new("delete", CommandKind::Delete);
        cmd.groups = vec!["pm1.g1".to_string()];
        let err = DataRoleValidator
            .validate_access("alice", &cmd, &metadata())
            .unwrap_err();
        assert!(err.get_msg().contains("<DELETE>"));
    }

    #[test]
    fn unmapped_user_denied() {
        DataRoleValidator
            .validate_access("bob", &query(&["pm1.g1"]), &metadata())
            .unwrap_err();
        AllowAllValidator
            .validate_access("bob", &query(&["pm1.g1"]), &metadata())
            .unwrap();
    }
}
