//! Source records and the ingestion deposit path.

mod ingest;
mod records;

pub use ingest::{IngestSummary, Ingestor};
pub use records::{
    AzRecord, CountryRef, EuRecord, FaoRecord, FpmaRecord, LocationRef, ObservationSource,
    ProductRef, SourceRecord,
};
