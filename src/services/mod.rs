pub mod fact_store;

pub use fact_store::SqliteFactStore;
