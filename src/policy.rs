//! Authorization policy: which check a card must pass, and running it.
//!
//! Two modes exist. UID-based authorization asks the card directory whether
//! an entitled account holds the card. The fallback code mode (used during
//! breaks, or when the operator relaxes the door) accepts any card whose
//! block0 ends in a configured manufacturer code, and degrades to the UID
//! check when the code does not match.
//!
//! Directory errors never grant access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::codec::{extract_uid, manufacturer_code, Block0};
use crate::schedule::SchedulePolicy;
use crate::store::CardDirectory;

/// Check a presented card must pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    UidBased,
    FallbackCode,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::UidBased => "uid_based",
            AuthMode::FallbackCode => "fallback_code",
        }
    }
}

/// One card presentation and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRead {
    pub raw_block0: String,
    pub extracted_uid: Option<String>,
    pub manufacturer_code: String,
    pub auth_mode: AuthMode,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl CardRead {
    /// Decode a `CARD` argument. The outcome starts as "UID check, denied".
    pub fn from_block0(raw_block0: &str) -> Self {
        let raw = raw_block0.trim();
        Self {
            raw_block0: raw.to_string(),
            extracted_uid: extract_uid(Block0::Hex(raw)),
            manufacturer_code: manufacturer_code(raw).to_ascii_lowercase(),
            auth_mode: AuthMode::UidBased,
            success: false,
            timestamp: Utc::now(),
        }
    }
}

/// Mode required by the current schedule state.
pub fn required_mode(policy: &SchedulePolicy) -> AuthMode {
    if policy.fallback_allowed() {
        AuthMode::FallbackCode
    } else {
        AuthMode::UidBased
    }
}

pub struct AuthorizationPolicy {
    manufacturer_codes: Vec<String>,
    directory: Arc<dyn CardDirectory>,
}

impl AuthorizationPolicy {
    /// `manufacturer_codes` are compared case-insensitively.
    pub fn new(manufacturer_codes: &[String], directory: Arc<dyn CardDirectory>) -> Self {
        Self {
            manufacturer_codes: manufacturer_codes
                .iter()
                .map(|c| c.trim().to_ascii_lowercase())
                .collect(),
            directory,
        }
    }

    fn code_accepted(&self, code: &str) -> bool {
        self.manufacturer_codes.iter().any(|c| c == code)
    }

    /// Run the check for `required`, recording mode and outcome on `card`.
    pub async fn authorize(&self, card: &mut CardRead, required: AuthMode) -> bool {
        card.auth_mode = required;

        let granted = match required {
            AuthMode::UidBased => self.uid_entitled(card.extracted_uid.as_deref()).await,
            AuthMode::FallbackCode if self.code_accepted(&card.manufacturer_code) => {
                debug!(code = %card.manufacturer_code, "Manufacturer code accepted");
                true
            }
            AuthMode::FallbackCode => {
                debug!(code = %card.manufacturer_code, "Manufacturer code mismatch, trying UID");
                let granted = self.uid_entitled(card.extracted_uid.as_deref()).await;
                if granted {
                    card.auth_mode = AuthMode::UidBased;
                }
                granted
            }
        };

        card.success = granted;
        info!(
            uid = card.extracted_uid.as_deref().unwrap_or("-"),
            mode = card.auth_mode.as_str(),
            granted,
            "Card authorization"
        );
        granted
    }

    async fn uid_entitled(&self, uid: Option<&str>) -> bool {
        let Some(uid) = uid else {
            return false;
        };
        let directory = self.directory.clone();
        let lookup_uid = uid.to_string();
        let result =
            tokio::task::spawn_blocking(move || directory.count_entitled_cards(&lookup_uid)).await;
        match result {
            Ok(Ok(count)) => count > 0,
            Ok(Err(e)) => {
                error!(uid, error = %e, "Card directory lookup failed, denying");
                false
            }
            Err(e) => {
                error!(uid, error = %e, "Card directory lookup panicked, denying");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDirectory;

    const VALID_BLOCK: &str = "0102030404131415161718";
    const BAD_BCC_BLOCK: &str = "0404040412131415161718";

    fn policy(directory: Arc<MemoryDirectory>) -> AuthorizationPolicy {
        AuthorizationPolicy::new(&["18".to_string()], directory)
    }

    #[test]
    fn test_card_read_decodes_block0() {
        let card = CardRead::from_block0(" 0102030404131415161718 ");
        assert_eq!(card.raw_block0, VALID_BLOCK);
        assert_eq!(card.extracted_uid.as_deref(), Some("01020304"));
        assert_eq!(card.manufacturer_code, "18");
        assert!(!card.success);
    }

    #[test]
    fn test_required_mode() {
        let mut state = SchedulePolicy::default();
        assert_eq!(required_mode(&state), AuthMode::UidBased);

        state.is_break = true;
        assert_eq!(required_mode(&state), AuthMode::FallbackCode);

        state.manual_override = true;
        state.manual_value = Some(true);
        assert_eq!(required_mode(&state), AuthMode::UidBased);

        state.is_break = false;
        state.manual_value = Some(false);
        assert_eq!(required_mode(&state), AuthMode::FallbackCode);
    }

    #[test]
    fn test_required_mode_is_stable_without_changes() {
        let state = SchedulePolicy {
            is_break: true,
            ..Default::default()
        };
        let first = required_mode(&state);
        assert!((0..10).all(|_| required_mode(&state) == first));
    }

    #[tokio::test]
    async fn test_uid_mode_grants_known_card() {
        let directory = MemoryDirectory::with_cards(&["01020304"]);
        let policy = policy(directory.clone());
        let mut card = CardRead::from_block0(VALID_BLOCK);
        assert!(policy.authorize(&mut card, AuthMode::UidBased).await);
        assert!(card.success);
        assert_eq!(card.auth_mode, AuthMode::UidBased);
        assert_eq!(directory.lookups(), 1);
    }

    #[tokio::test]
    async fn test_uid_mode_denies_unknown_card() {
        let policy = policy(MemoryDirectory::with_cards(&[]));
        let mut card = CardRead::from_block0(VALID_BLOCK);
        assert!(!policy.authorize(&mut card, AuthMode::UidBased).await);
        assert!(!card.success);
    }

    #[tokio::test]
    async fn test_bad_checksum_is_denied_without_lookup() {
        let directory = MemoryDirectory::with_cards(&["04040404"]);
        let policy = policy(directory.clone());
        let mut card = CardRead::from_block0(BAD_BCC_BLOCK);
        assert!(card.extracted_uid.is_none());
        assert!(!policy.authorize(&mut card, AuthMode::UidBased).await);
        assert_eq!(directory.lookups(), 0);
    }

    #[tokio::test]
    async fn test_fallback_code_grants_without_lookup() {
        let directory = MemoryDirectory::with_cards(&[]);
        let policy = policy(directory.clone());
        let mut card = CardRead::from_block0(VALID_BLOCK);
        assert!(policy.authorize(&mut card, AuthMode::FallbackCode).await);
        assert_eq!(card.auth_mode, AuthMode::FallbackCode);
        assert_eq!(directory.lookups(), 0);
    }

    #[tokio::test]
    async fn test_fallback_code_accepts_bad_checksum() {
        // only the manufacturer code matters in this mode
        let policy = policy(MemoryDirectory::with_cards(&[]));
        let mut card = CardRead::from_block0(BAD_BCC_BLOCK);
        assert!(policy.authorize(&mut card, AuthMode::FallbackCode).await);
    }

    #[tokio::test]
    async fn test_fallback_mismatch_degrades_to_uid_check() {
        let directory = MemoryDirectory::with_cards(&["01020304"]);
        let policy = policy(directory.clone());
        let mut card = CardRead::from_block0("01020304041314151617ab");
        assert!(policy.authorize(&mut card, AuthMode::FallbackCode).await);
        assert_eq!(card.auth_mode, AuthMode::UidBased);
        assert_eq!(directory.lookups(), 1);

        let mut stranger = CardRead::from_block0("050607080c131415161799");
        assert!(!policy.authorize(&mut stranger, AuthMode::FallbackCode).await);
        assert_eq!(stranger.auth_mode, AuthMode::FallbackCode);
    }

    #[tokio::test]
    async fn test_codes_compare_case_insensitively() {
        let codes = ["AB".to_string(), "18".to_string()];
        let policy = AuthorizationPolicy::new(&codes, MemoryDirectory::with_cards(&[]));
        let mut card = CardRead::from_block0("01020304041314151617AB");
        assert!(policy.authorize(&mut card, AuthMode::FallbackCode).await);
    }

    #[tokio::test]
    async fn test_directory_failure_denies() {
        let directory = MemoryDirectory::with_cards(&["01020304"]);
        directory.set_failing(true);
        let policy = policy(directory);
        let mut card = CardRead::from_block0(VALID_BLOCK);
        assert!(!policy.authorize(&mut card, AuthMode::UidBased).await);
    }
}
