pub mod catalog;
pub mod classified;
pub mod document;
pub mod sync_result;
