//! `stocktake-auth` — pure authorization boundary.
//!
//! Authentication is out of scope for the counting engine; this crate only
//! answers "may this principal perform this operation in this tenant". It is
//! intentionally decoupled from HTTP and storage.

pub mod authorize;
pub mod permissions;
pub mod principal;
pub mod roles;

pub use authorize::{authorize, AuthzError, Principal};
pub use permissions::Permission;
pub use principal::{PrincipalId, TenantMembership};
pub use roles::Role;
