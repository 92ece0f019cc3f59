pub mod destinations;
pub mod domain;
pub mod error;
pub mod protocol;
