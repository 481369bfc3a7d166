use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Anonymous,
    Owner,
    Manager,
    Admin,
    System,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "anonymous" | "guest" => Some(Role::Anonymous),
            "owner" | "user" => Some(Role::Owner),
            "manager" => Some(Role::Manager),
            "admin" => Some(Role::Admin),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anonymous => "anonymous",
            Role::Owner => "owner",
            Role::Manager => "manager",
            Role::Admin => "admin",
            Role::System => "system",
        }
    }

    /// Association staff allowed to run gatherings.
    pub fn can_manage(&self) -> bool {
        matches!(self, Role::Manager | Role::Admin | Role::System)
    }

    pub fn can_vote(&self) -> bool {
        matches!(self, Role::Owner) || self.can_manage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_user_role_maps_to_owner() {
        assert_eq!(Role::parse("user"), Some(Role::Owner));
        assert!(Role::Owner.can_vote());
        assert!(!Role::Owner.can_manage());
        assert!(Role::Manager.can_manage());
        assert!(!Role::Anonymous.can_vote());
        assert_eq!(Role::parse("root"), None);
    }
}
