pub mod history;
pub mod preferences;
pub mod store;
