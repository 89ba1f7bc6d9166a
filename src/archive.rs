use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, NamedTempFile};

use crate::domain::SourceKind;
use crate::error::IngestError;
use crate::normalize::IndicatorBatch;
use crate::record::RawRecord;

pub const CSV_HEADER: [&str; 10] = [
    "country_code",
    "country",
    "indicator",
    "year",
    "value",
    "series_code",
    "class_code",
    "class_name",
    "nature",
    "reporting_type",
];

pub fn raw_archive_path(raw_dir: &Utf8Path, kind: SourceKind) -> Utf8PathBuf {
    raw_dir.join(format!("{kind}_raw.json"))
}

pub fn batch_csv_path(output_dir: &Utf8Path, kind: SourceKind) -> Utf8PathBuf {
    output_dir.join(format!("{kind}.csv"))
}

pub fn save_raw(records: &[RawRecord], destination: &Utf8Path) -> Result<(), IngestError> {
    let mut temp = temp_beside(destination)?;
    serde_json::to_writer_pretty(&mut temp, records)
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    temp.write_all(b"\n")
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    persist(temp, destination)
}

pub fn write_batch_csv(batch: &IndicatorBatch, destination: &Utf8Path) -> Result<(), IngestError> {
    let temp = temp_beside(destination)?;
    let mut writer = csv::Writer::from_writer(temp);
    writer
        .write_record(CSV_HEADER)
        .map_err(|err| IngestError::Csv(err.to_string()))?;
    for row in &batch.rows {
        writer
            .write_record([
                opt(&row.country_code),
                opt(&row.country),
                row.indicator.clone(),
                row.year.map(|y| y.to_string()).unwrap_or_default(),
                row.value.map(|v| v.to_string()).unwrap_or_default(),
                opt(&row.series_code),
                opt(&row.class_code),
                opt(&row.class_name),
                opt(&row.nature),
                opt(&row.reporting_type),
            ])
            .map_err(|err| IngestError::Csv(err.to_string()))?;
    }
    let temp = writer
        .into_inner()
        .map_err(|err| IngestError::Csv(err.to_string()))?;
    persist(temp, destination)
}

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn temp_beside(destination: &Utf8Path) -> Result<NamedTempFile, IngestError> {
    let parent = destination
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| IngestError::Filesystem(format!("create {parent}: {err}")))?;
    Builder::new()
        .prefix(".indicator-ingest")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))
}

fn persist(temp: NamedTempFile, destination: &Utf8Path) -> Result<(), IngestError> {
    temp.as_file()
        .sync_all()
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    temp.persist(destination.as_std_path())
        .map_err(|err| IngestError::Filesystem(format!("write {destination}: {}", err.error)))?;
    Ok(())
}
