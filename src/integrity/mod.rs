pub mod error;
pub mod types;
pub mod verifier;

pub use error::{IntegrityError, IntegrityResult};
pub use types::ContentHash;
pub use verifier::{frontend_digest, IntegrityVerifier, StreamingHasher};
