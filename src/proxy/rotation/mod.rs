//! Egress rotation
//!
//! Outbound requests leave through a pool of egress identities. The pool
//! keeps a cursor on the current candidate, advances it round-robin on
//! rotation and skips candidates that are switched off or have failed too
//! many times in a row.

mod round_robin;

pub use round_robin::EgressPool;
