//! A team-chat workspace, mounted as a filesystem.
//!
//! The directory tree enumerates rooms and members; reading a room's
//! `session` file streams its transcript, writing its `write` file posts a
//! message, and small per-user attribute files serve live metadata. A
//! bootstrap snapshot builds the tree, a long-lived event stream mutates
//! it, and per-room history requests backfill the transcripts.

#![forbid(clippy::todo, clippy::unimplemented)]

pub mod client;
pub mod conn;
pub mod dirset;
pub mod error;
pub mod fs;
pub mod model;
pub mod session;
pub mod sets;
pub mod tree;

pub use crate::conn::Conn;
pub use crate::error::Error;
pub use crate::fs::ChatFs;
