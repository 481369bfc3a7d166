use serde::{Deserialize, Serialize};

/// Who performed an operation, plus where the request came from.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActorIdentity {
    pub user_id: String,
    pub username: String,
    pub origin_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ActorIdentity {
    pub fn with_user_id(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            user_id: user_id.clone(),
            username: user_id,
            origin_ip: None,
            user_agent: None,
        }
    }

    pub fn with_origin(mut self, origin_ip: Option<String>, user_agent: Option<String>) -> Self {
        self.origin_ip = origin_ip;
        self.user_agent = user_agent;
        self
    }
}
