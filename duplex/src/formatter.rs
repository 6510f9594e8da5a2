use colored::*;
use greet_service::conformance::ConformanceReport;
use greet_service::pb::GreetResponse;
use greet_service::schema::to_json;
use std::fmt::Display;

/// A wrapper struct for a formatted, colored string.
///
/// Implements `Display` so it can be printed directly.
pub struct FormattedString(pub String);

/// One greeting received by a demo client.
pub struct Greeting<'a>(pub &'a str, pub &'a GreetResponse);

impl Display for FormattedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.0)
    }
}

impl From<serde_json::Value> for FormattedString {
    fn from(value: serde_json::Value) -> Self {
        FormattedString(serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()))
    }
}

impl From<ConformanceReport> for FormattedString {
    fn from(report: ConformanceReport) -> Self {
        let responses: Vec<_> = report.responses.iter().map(to_json).collect();
        let mut out = format!(
            "{} {} responses\n",
            "Connect and gRPC agree:".green().bold(),
            responses.len()
        );
        out.push_str(&FormattedString::from(serde_json::Value::Array(responses)).0);
        FormattedString(out)
    }
}

impl From<Greeting<'_>> for FormattedString {
    fn from(Greeting(protocol, response): Greeting<'_>) -> Self {
        FormattedString(format!(
            "{}: Got greeting {:?}",
            protocol.cyan(),
            response.message
        ))
    }
}

impl From<anyhow::Error> for FormattedString {
    fn from(err: anyhow::Error) -> Self {
        FormattedString(format!("{}\n\n'{:#}'", "Error:".red().bold(), err))
    }
}
