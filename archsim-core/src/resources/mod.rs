//! Memory devices that can back a guest memory interface.

pub mod ram;
