use std::io::Read;

use booksync_core::RawRecord;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CsvError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("CSV file has no header row")]
    MissingHeader,
}

/// Reads a full CSV export into raw records, one map per data row with
/// the original header text as keys. The export is a periodic bulk
/// replace, so the whole file is read per sync pass; key normalization
/// and type coercion happen later in the ingestor.
pub fn read_csv_records<R: Read>(data: R) -> Result<Vec<RawRecord>, CsvError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() {
        return Err(CsvError::MissingHeader);
    }

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result?;
        if row.is_empty() {
            continue;
        }
        let mut record = RawRecord::new();
        for (idx, header) in headers.iter().enumerate() {
            let value = row.get(idx).unwrap_or_default();
            record.insert(
                header.clone(),
                serde_json::Value::String(value.to_string()),
            );
        }
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_headers_as_keys() {
        let data = b"Invoice ID,Invoice Number,Total\n399001,INV-001,150.00\n399002,INV-002,75.50\n";
        let records = read_csv_records(data.as_ref()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].get("Invoice ID").and_then(|v| v.as_str()),
            Some("399001")
        );
        assert_eq!(
            records[1].get("Total").and_then(|v| v.as_str()),
            Some("75.50")
        );
    }

    #[test]
    fn preserves_pascal_case_headers_verbatim() {
        // Normalization is the ingestor's job; the reader must not touch
        // header spelling beyond trimming whitespace.
        let data = b"SalesOrder ID,SalesOrder Number\nSO-1,SO-0001\n";
        let records = read_csv_records(data.as_ref()).unwrap();
        assert!(records[0].contains_key("SalesOrder ID"));
        assert!(!records[0].contains_key("sales_order_id"));
    }

    #[test]
    fn short_rows_leave_missing_fields_empty() {
        let data = b"A,B,C\n1,2\n";
        let records = read_csv_records(data.as_ref()).unwrap();
        assert_eq!(records[0].get("C").and_then(|v| v.as_str()), Some(""));
    }

    #[test]
    fn empty_file_yields_no_records() {
        let records = read_csv_records(b"A,B\n".as_ref()).unwrap();
        assert!(records.is_empty());
    }
}
