//! WARC export (spec §6.5 `results export --format warc`). JSONL export is
//! fully implemented on [`crate::store::Store::export_results_jsonl`]; WARC
//! is named by the spec but its formatter is explicitly an external
//! collaborator (spec §1), so this module defines the seam a caller can
//! plug a real writer into without re-specifying the out-of-scope format.

use thiserror::Error;

use crate::model::ResultRow;

#[derive(Debug, Error)]
pub enum WarcError {
    #[error("WARC export requires an external WarcWriter implementation; none is bundled")]
    NotImplemented,

    #[error("WARC write failed: {0}")]
    Write(String),
}

/// Formats Results as WARC records. No implementation ships in this crate
/// (spec §1 Non-goals: the WARC formatter is an external collaborator);
/// callers integrating a real WARC library implement this trait themselves.
pub trait WarcWriter {
    fn write_result(&mut self, result: &ResultRow) -> Result<(), WarcError>;
    fn finish(self: Box<Self>) -> Result<(), WarcError>;
}

/// Writes every Result through a [`WarcWriter`]. With no writer configured,
/// callers should surface [`WarcError::NotImplemented`] rather than silently
/// falling back to another format.
pub fn export_warc(results: &[ResultRow], writer: Option<&mut dyn WarcWriter>) -> Result<(), WarcError> {
    let writer = writer.ok_or(WarcError::NotImplemented)?;
    for result in results {
        writer.write_result(result)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_without_a_writer_reports_not_implemented() {
        let results = vec![];
        let err = export_warc(&results, None).unwrap_err();
        assert!(matches!(err, WarcError::NotImplemented));
    }
}
