pub mod jwt;
pub mod pool;
pub mod store;

pub use jwt::{decode_payload, Claims};
pub use pool::{CredentialPool, CredentialRecord, PoolStats};
