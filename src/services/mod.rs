pub mod access;
pub mod conversation_service;
pub mod identity;
pub mod transaction;

pub use access::{can_access, is_active_admin, AccessControl, AccessGrant};
pub use conversation_service::{
    ConversationService, NewConversationWithMessage, TransactionPolicies,
};
pub use identity::{extract_bearer, IdentityVerifier, JwtIdentityVerifier};
pub use transaction::TransactionPolicy;
