//! Authentication and session lifecycle: token issuance, the verification gate,
//! the public-route guard and the revocation blacklist.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod token;
mod gate;
mod provider;
pub mod revocation;

pub use principal::{Principal, Role, UserId};
pub use token::{Claims, TokenError, TokenIssuer};
pub use gate::{authorize, block_authenticated, extract_token, require_auth, AuthGate, AuthRejection, RoleGate, ACCESS_COOKIE};
pub use provider::{AuthService, LoginRequest, LoginResponse, ProfileUpdate, RegisterRequest};
pub use revocation::{Blacklist, MemoryRevocationStore, RedisRevocationStore, RevocationError, RevocationStore};
