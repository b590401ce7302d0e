//! Domain entities — users, polling state, check-ins, trustees, letters, vault, audit.

pub mod audit;
pub mod checkin;
pub mod letter;
pub mod polling;
pub mod trustee;
pub mod user;
pub mod vault;

pub use audit::{AuditEntry, AuditKind};
pub use checkin::{CheckIn, CheckInStatus, Observer, SendChannel};
pub use letter::{FinalLetter, LetterStatus};
pub use polling::{PollingConfig, PollingInterval, PollingStatus};
pub use trustee::{Trustee, TrusteeStatus};
pub use user::User;
pub use vault::{Vault, VaultItem, VaultSnapshot};
