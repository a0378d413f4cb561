pub mod dummy;
pub mod feed;
