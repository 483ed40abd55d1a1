use rand::{distributions::Uniform, Rng};
use std::sync::Arc;
use std::time::Duration;

use crate::models::InviteCode;
use crate::services::credential_store::CredentialStore;
use crate::services::timeout::within;
use crate::services::ServiceError;

const INVITE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const INVITE_CODE_LEN: usize = 8;
const ISSUE_ATTEMPTS: usize = 3;

/// Eight characters from `A-Z0-9`, drawn from the thread-local CSPRNG.
pub fn generate_invite_code() -> String {
    let between = Uniform::from(0..INVITE_ALPHABET.len());
    let mut rng = rand::thread_rng();
    (0..INVITE_CODE_LEN)
        .map(|_| INVITE_ALPHABET[rng.sample(between)] as char)
        .collect()
}

/// Issues and checks invite codes. Redemption happens inside
/// [`CredentialStore::register_with_invite`].
#[derive(Clone)]
pub struct InviteLedger {
    store: Arc<dyn CredentialStore>,
    timeout: Duration,
}

impl InviteLedger {
    pub fn new(store: Arc<dyn CredentialStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn issue(&self) -> Result<InviteCode, ServiceError> {
        for attempt in 1..=ISSUE_ATTEMPTS {
            let invite = InviteCode::new(generate_invite_code());
            match within(self.timeout, "database", self.store.insert_invite(&invite)).await {
                Ok(()) => {
                    metrics::counter!("invites_issued_total").increment(1);
                    tracing::info!("Invite code issued");
                    return Ok(invite);
                }
                Err(ServiceError::DuplicateInviteCode) => {
                    tracing::warn!(attempt = attempt, "Invite code collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ServiceError::DuplicateInviteCode)
    }

    /// True if the code exists and has not been redeemed. Read-only.
    pub async fn check(&self, code: &str) -> Result<bool, ServiceError> {
        if code.is_empty() {
            return Ok(false);
        }
        let invite = within(self.timeout, "database", self.store.find_invite(code)).await?;
        Ok(invite.is_some_and(|i| i.is_redeemable()))
    }
}
