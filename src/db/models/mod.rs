//! Database models. Re-exported so callers can `use crate::db::models::*;`.

pub mod channel;

pub use self::channel::*;
