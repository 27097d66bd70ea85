use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

/// One shared password for every login; the user name is the caller identity.
#[derive(Debug)]
pub struct RoomkeepAuthSource {
    password: String,
}

impl RoomkeepAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RoomkeepAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user();
        let user = user.as_deref();
        tracing::debug!(user = ?user, database = ?login.database(), "login");
        require_user(user)?;
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// The user name becomes the reservation owner, so it must not be blank.
fn require_user(user: Option<&str>) -> PgWireResult<&str> {
    match user.map(str::trim) {
        Some(user) if !user.is_empty() => Ok(user),
        _ => {
            tracing::warn!("login rejected: empty user name");
            Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "user name must not be empty".into(),
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_user_names_are_rejected() {
        assert_eq!(require_user(Some("alice")).unwrap(), "alice");
        for user in [None, Some(""), Some("   ")] {
            assert!(require_user(user).is_err(), "{user:?} should be rejected");
        }
    }
}
