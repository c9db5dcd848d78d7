//! Mirror data model.
//!
//! These types are serialised in a DB-friendly way: IDs and datetimes use
//! MongoDB's own formats, while addresses and hashes are stored as their
//! canonical `0x`-prefixed strings.

pub mod address;
pub mod audit;
pub mod candidate;
pub mod hash;
pub mod mongodb;
pub mod session;
pub mod vote;
pub mod voter;
