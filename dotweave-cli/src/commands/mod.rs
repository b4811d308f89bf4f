pub mod common;
pub mod inspect;
pub mod notify;
pub mod restore;
pub mod serve;
pub mod signatures;
pub mod weave;
