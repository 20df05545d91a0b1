//! Signed payload exchange between nodes

pub mod signed;

pub use signed::{sign, verify, KeyResolver, KeySource, ProtocolError, Verification, SIG_FIELD};
