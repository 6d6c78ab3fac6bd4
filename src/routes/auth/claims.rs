use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session claims issued by the external auth service.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Claims {
    pub id: String, // account UUID
    pub email: String,
    pub exp: usize, // expiration (as UNIX timestamp)
    pub iss: String,
    pub aud: String,
}

impl Claims {
    pub fn account_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.id).ok()
    }
}
