//! Permission service

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    View,
    Execute,
    Edit,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Permission::View => "view",
            Permission::Execute => "execute",
            Permission::Edit => "edit",
        })
    }
}

/// Permission checks against the external permission store
#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn check_permission(
        &self,
        user_id: &str,
        project_id: &str,
        pipeline_id: &str,
        permission: Permission,
    ) -> Result<bool>;

    /// Pipeline ids of a project the user holds `permission` on
    async fn get_resource_by_permission(
        &self,
        user_id: &str,
        project_id: &str,
        permission: Permission,
    ) -> Result<Vec<String>>;
}
