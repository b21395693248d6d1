//! Wire models for the changes-feed protocol.

pub mod change;
pub mod db_info;
pub mod seq;

pub use change::{Change, ChangeRev};
pub use db_info::DbInfo;
pub use seq::Seq;
