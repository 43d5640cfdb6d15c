//! JSON report formatter.

use serde::Serialize;

use super::ReportFormatter;
use crate::session::AnalysisSession;
use crate::SessionError;

/// Serializable session report for JSON output
#[derive(Serialize)]
struct ReportJson {
    /// ISA the session ran under
    architecture: String,
    /// Total retired instructions observed
    instructions: u64,
}

/// Single JSON object output.
pub struct JsonFormatter;

impl ReportFormatter for JsonFormatter {
    fn format(&self, session: &AnalysisSession) -> Result<String, SessionError> {
        let report = ReportJson {
            architecture: session.architecture().to_string(),
            instructions: session.instruction_count(),
        };

        serde_json::to_string(&report).map_err(|e| {
            SessionError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}
