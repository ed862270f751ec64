pub mod csv;
pub mod fetch;
pub mod ingest;

pub use csv::{read_csv_records, CsvError};
pub use fetch::{DumpFetcher, FetchError, RecordFetcher};
pub use ingest::{IngestError, IngestOutcome, RecordIngestor};
