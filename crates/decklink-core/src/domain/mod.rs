//! Domain entities for Deck-Link.
//!
//! Pure data types with no I/O.  Code in the pairing state machine and in the
//! daemon depends on these types; they depend on nothing but `serde` and
//! `uuid`.

/// Peers found by discovery or typed in by hand.
pub mod peer;

/// The single active pairing context and its identifiers.
pub mod session;
