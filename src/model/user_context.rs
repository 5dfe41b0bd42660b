use crate::model::User;
use serde::{Deserialize, Serialize};

/// Acting user extracted from request headers; every mutation is authorized against it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
}

impl UserContext {
    /// Identity with no profile details
    pub fn new(user_id: String) -> Self {
        Self {
            user_id,
            user_email: None,
            user_name: None,
        }
    }

    pub fn with_details(user_id: String, email: Option<String>, name: Option<String>) -> Self {
        Self {
            user_id,
            user_email: email,
            user_name: name,
        }
    }

    /// Fallback identity when a request carries no `X-User-Id`
    pub fn default_user() -> Self {
        Self {
            user_id: "dev-user".to_string(),
            user_email: Some("dev@localhost".to_string()),
            user_name: Some("Development User".to_string()),
        }
    }
}

impl From<&UserContext> for User {
    fn from(ctx: &UserContext) -> Self {
        User {
            id: ctx.user_id.clone(),
            email: ctx.user_email.clone(),
            name: ctx.user_name.clone(),
        }
    }
}

impl Default for UserContext {
    fn default() -> Self {
        Self::default_user()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_record_from_context() {
        let ctx = UserContext::with_details(
            "u-7".to_string(),
            Some("seven@example.com".to_string()),
            None,
        );
        let user = User::from(&ctx);
        assert_eq!(user.id, "u-7");
        assert_eq!(user.email.as_deref(), Some("seven@example.com"));
        assert_eq!(user.name, None);
    }

    #[test]
    fn test_default_is_development_user() {
        assert_eq!(UserContext::default().user_id, "dev-user");
        assert_eq!(UserContext::new("x".to_string()).user_email, None);
    }
}
