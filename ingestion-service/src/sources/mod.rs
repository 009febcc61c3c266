pub mod http_json;
pub mod reading_backfill_file;
pub mod reading_csv_file;
pub mod simulator;

pub use http_json::HttpJsonSource;
pub use reading_backfill_file::ReadingBackfillFileSource;
pub use reading_csv_file::ReadingCsvFileSource;
pub use simulator::SimulatorSource;
