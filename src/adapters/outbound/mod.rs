mod memory_data_service;
mod sqlite_data_service;

pub use memory_data_service::MemoryDataService;
pub use sqlite_data_service::SqliteDataService;
