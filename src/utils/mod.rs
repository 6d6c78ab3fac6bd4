pub mod access_guard;
pub mod entitlement;
pub mod jwt;
pub mod time;
