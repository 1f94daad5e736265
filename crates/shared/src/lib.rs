//! Shared plumbing used by every Lingkar crate.

pub mod db;
pub mod period;
