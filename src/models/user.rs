use serde::Serialize;
use sqlx::FromRow;

/// Reserved id of the anonymous uploader.
pub const GUEST_USER_ID: i64 = 2;
pub const GUEST_USERNAME: &str = "guest";

#[derive(Serialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
}

impl User {
    /// Identity used for requests without a valid session.
    pub fn guest() -> Self {
        Self {
            id: GUEST_USER_ID,
            username: GUEST_USERNAME.to_string(),
        }
    }

    pub fn is_guest(&self) -> bool {
        self.id == GUEST_USER_ID
    }
}
