pub mod alerts;
pub mod summary;
