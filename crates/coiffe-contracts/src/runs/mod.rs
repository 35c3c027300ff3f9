pub mod cache;
pub mod receipts;
pub mod summary;
