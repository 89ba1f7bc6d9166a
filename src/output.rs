use std::io::{self, Write};

use serde::Serialize;

use crate::domain::SourceKind;
use crate::orchestrator::RunSummary;

#[derive(Debug, Clone, Serialize)]
pub struct SourceList {
    pub sources: Vec<SourceKind>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_sources(list: &SourceList) -> io::Result<()> {
        Self::print_json(list)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
