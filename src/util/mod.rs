//! Time, randomization, helpers

pub mod bytestream;
pub mod rand;
pub mod time;
