use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct InviteCode {
    pub code: String,
    pub used: bool,
    pub used_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl InviteCode {
    pub fn new(code: String) -> Self {
        Self {
            code,
            used: false,
            used_by: None,
            created_at: Utc::now(),
            used_at: None,
        }
    }

    pub fn is_redeemable(&self) -> bool {
        !self.used
    }

    /// Marks the code as redeemed by `user_id`. Returns false if it was already used.
    pub fn redeem(&mut self, user_id: i64) -> bool {
        if self.used {
            return false;
        }
        self.used = true;
        self.used_by = Some(user_id);
        self.used_at = Some(Utc::now());
        true
    }
}
