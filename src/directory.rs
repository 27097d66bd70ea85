use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::model::{Role, UserId};
use crate::store::StoreError;

/// Who holds the admin role.
#[async_trait]
pub trait AdminDirectory: Send + Sync {
    async fn list_admins(&self) -> Result<Vec<UserId>, StoreError>;

    async fn role_of(&self, user: &str) -> Result<Role, StoreError> {
        let admins = self.list_admins().await?;
        Ok(if admins.iter().any(|a| a == user) {
            Role::Admin
        } else {
            Role::Member
        })
    }
}

/// Admin names fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticAdminDirectory {
    admins: BTreeSet<UserId>,
}

impl StaticAdminDirectory {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        Self {
            admins: admins
                .into_iter()
                .map(Into::into)
                .filter(|a: &UserId| !a.is_empty())
                .collect(),
        }
    }
}

#[async_trait]
impl AdminDirectory for StaticAdminDirectory {
    async fn list_admins(&self) -> Result<Vec<UserId>, StoreError> {
        Ok(self.admins.iter().cloned().collect())
    }

    async fn role_of(&self, user: &str) -> Result<Role, StoreError> {
        Ok(if self.admins.contains(user) {
            Role::Admin
        } else {
            Role::Member
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roles_from_static_list() {
        let dir = StaticAdminDirectory::new(["admin", "", "facilities"]);
        assert_eq!(dir.list_admins().await.unwrap(), vec!["admin", "facilities"]);
        assert_eq!(dir.role_of("admin").await.unwrap(), Role::Admin);
        assert_eq!(dir.role_of("alice").await.unwrap(), Role::Member);
    }
}
