//! Report output formats.

mod json;

pub use self::json::JsonFormatter;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::session::AnalysisSession;
use crate::SessionError;

/// Supported report formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Bare decimal instruction count (default)
    Text,
    /// JSON object with session details
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get a formatter for this output format
    pub fn formatter(&self) -> Box<dyn ReportFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
        }
    }
}

/// Renders a finished session for emission on stdout.
pub trait ReportFormatter {
    /// Format the session's final state as one line of output.
    fn format(&self, session: &AnalysisSession) -> Result<String, SessionError>;
}

/// Bare decimal count. The canonical output of the tool: nothing surrounds
/// the number.
pub struct TextFormatter;

impl ReportFormatter for TextFormatter {
    fn format(&self, session: &AnalysisSession) -> Result<String, SessionError> {
        Ok(session.instruction_count().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Architecture;

    fn session_with_count(n: u64) -> AnalysisSession {
        let mut session = AnalysisSession::new(Architecture::X86_64);
        for _ in 0..n {
            session.record_instruction();
        }
        session
    }

    #[test]
    fn test_format_display_and_parse() {
        assert_eq!(OutputFormat::Text.to_string(), "text");
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_text_is_the_bare_decimal_count() {
        let out = TextFormatter.format(&session_with_count(42)).unwrap();
        assert_eq!(out, "42");
    }

    #[test]
    fn test_json_round_trips_the_count() {
        let out = OutputFormat::Json
            .formatter()
            .format(&session_with_count(7))
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["instructions"], 7);
        assert_eq!(value["architecture"], "x86-64");
    }
}
