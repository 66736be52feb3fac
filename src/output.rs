//! Append-only record output in JSON Lines or CSV.
//!
//! Every record occupies exactly one line in either format, so a crash can at
//! worst leave one torn line at the end of the file. [`OutputWriter::open`]
//! cuts that line off before appending, and [`OutputWriter::scan_ids`] reads
//! back the ids of everything already written.

use crate::config::OutputFormat;
use crate::error::{HarvestError, IoResultExt, Result};
use crate::record::Record;
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Column order of CSV output
pub const CSV_HEADER: [&str; 14] = [
    "id",
    "doi",
    "title",
    "authors",
    "venue",
    "date",
    "year",
    "cited_by",
    "document_type",
    "abstract",
    "keywords",
    "link",
    "query_id",
    "raw",
];

pub struct OutputWriter {
    path: PathBuf,
    format: OutputFormat,
    include_raw: bool,
    file: File,
    needs_header: bool,
    written: u64,
}

impl OutputWriter {
    /// Open `path` for appending, creating it and its parent directory if needed.
    ///
    /// With `fresh` any existing content is discarded.
    pub fn open(path: &Path, format: OutputFormat, include_raw: bool, fresh: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).storage_at(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .storage_at(path)?;

        let len = if fresh {
            file.set_len(0).storage_at(path)?;
            file.sync_data().storage_at(path)?;
            info!(path = %path.display(), "Truncated output for a fresh run");
            0
        } else {
            truncate_torn_tail(&mut file, path)?
        };
        file.seek(SeekFrom::End(0)).storage_at(path)?;

        debug!(path = %path.display(), bytes = len, ?format, "Opened output");
        Ok(Self {
            path: path.to_path_buf(),
            format,
            include_raw,
            file,
            needs_header: format == OutputFormat::Csv && len == 0,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended through this writer.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append `records` and make them durable before returning.
    pub fn write(&mut self, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let buf = match self.format {
            OutputFormat::Jsonl => self.encode_jsonl(records)?,
            OutputFormat::Csv => self.encode_csv(records)?,
        };

        self.file.write_all(&buf).storage_at(&self.path)?;
        self.file.flush().storage_at(&self.path)?;
        self.file.sync_data().storage_at(&self.path)?;

        self.needs_header = false;
        self.written += records.len() as u64;
        Ok(records.len())
    }

    fn encode_jsonl(&self, records: &[Record]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, &self.shaped(record))?;
            buf.push(b'\n');
        }
        Ok(buf)
    }

    fn encode_csv(&self, records: &[Record]) -> Result<Vec<u8>> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        if self.needs_header {
            wtr.write_record(CSV_HEADER)?;
        }
        for record in records {
            wtr.write_record(self.csv_row(record)?)?;
        }
        wtr.into_inner()
            .map_err(|e| HarvestError::storage(&self.path, e.into_error()))
    }

    /// `record` without its raw payload unless raw output is enabled.
    fn shaped<'r>(&self, record: &'r Record) -> Cow<'r, Record> {
        if self.include_raw || record.raw.is_none() {
            Cow::Borrowed(record)
        } else {
            Cow::Owned(Record {
                raw: None,
                ..record.clone()
            })
        }
    }

    fn csv_row(&self, record: &Record) -> Result<Vec<String>> {
        let raw = match (&record.raw, self.include_raw) {
            (Some(raw), true) => serde_json::to_string(raw)?,
            _ => String::new(),
        };
        let opt = |v: &Option<String>| v.as_deref().map(one_line).unwrap_or_default();

        Ok(vec![
            one_line(&record.id),
            opt(&record.doi),
            one_line(&record.title),
            one_line(&record.authors.join("; ")),
            one_line(&record.venue),
            opt(&record.date),
            record.year.map(|y| y.to_string()).unwrap_or_default(),
            record.cited_by.map(|c| c.to_string()).unwrap_or_default(),
            opt(&record.document_type),
            opt(&record.abstract_text),
            one_line(&record.keywords.join("; ")),
            opt(&record.link),
            one_line(&record.query_id),
            raw,
        ])
    }

    /// Ids of all complete records in an existing output file.
    ///
    /// A missing file yields an empty set. Lines that cannot be read back are
    /// skipped with a warning.
    pub fn scan_ids(path: &Path, format: OutputFormat) -> Result<HashSet<String>> {
        if !path.exists() {
            return Ok(HashSet::new());
        }
        let ids = match format {
            OutputFormat::Jsonl => scan_jsonl(path)?,
            OutputFormat::Csv => scan_csv(path)?,
        };
        info!(path = %path.display(), records = ids.len(), "Scanned existing output");
        Ok(ids)
    }
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

fn scan_jsonl(path: &Path) -> Result<HashSet<String>> {
    let reader = BufReader::new(File::open(path).storage_at(path)?);
    let mut ids = HashSet::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.storage_at(path)?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IdOnly>(&line) {
            Ok(entry) => {
                ids.insert(entry.id);
            }
            Err(e) => warn!(path = %path.display(), line = idx + 1, error = %e, "Skipping unreadable output line"),
        }
    }
    Ok(ids)
}

fn scan_csv(path: &Path) -> Result<HashSet<String>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let column = rdr
        .headers()?
        .iter()
        .position(|h| h == "id")
        .unwrap_or(0);

    let mut ids = HashSet::new();
    for (idx, row) in rdr.records().enumerate() {
        match row {
            Ok(row) => {
                if let Some(id) = row.get(column).filter(|id| !id.is_empty()) {
                    ids.insert(id.to_string());
                }
            }
            Err(e) => warn!(path = %path.display(), row = idx + 1, error = %e, "Skipping unreadable output row"),
        }
    }
    Ok(ids)
}

/// Cut everything after the last newline. Returns the resulting length.
fn truncate_torn_tail(file: &mut File, path: &Path) -> Result<u64> {
    let len = file.metadata().storage_at(path)?.len();
    let mut buf = [0u8; 8192];
    let mut end = len;
    let mut keep = 0;

    while end > 0 {
        let chunk = end.min(buf.len() as u64) as usize;
        let from = end - chunk as u64;
        file.seek(SeekFrom::Start(from)).storage_at(path)?;
        file.read_exact(&mut buf[..chunk]).storage_at(path)?;
        if let Some(pos) = buf[..chunk].iter().rposition(|&b| b == b'\n') {
            keep = from + pos as u64 + 1;
            break;
        }
        end = from;
    }

    if keep < len {
        warn!(
            path = %path.display(),
            dropped_bytes = len - keep,
            "Dropping incomplete trailing record from output"
        );
        file.set_len(keep).storage_at(path)?;
        file.sync_data().storage_at(path)?;
    }
    Ok(keep)
}

fn one_line(s: &str) -> String {
    if s.contains(['\n', '\r']) {
        s.replace("\r\n", " ").replace(['\n', '\r'], " ")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn tmp() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    fn rec(id: &str) -> Record {
        Record {
            id: id.to_string(),
            title: format!("Paper {}", id),
            authors: vec!["Putnam R.".into(), "Coleman J.".into()],
            keywords: vec!["trust".into()],
            year: Some(2001),
            query_id: "q1".into(),
            raw: Some(json!({ "eid": id })),
            ..Default::default()
        }
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).expect("read output")
    }

    #[test]
    fn test_jsonl_append_and_scan() -> Result<()> {
        let dir = tmp();
        let path = dir.path().join("out").join("records.jsonl");

        let mut writer = OutputWriter::open(&path, OutputFormat::Jsonl, true, false)?;
        assert_eq!(writer.write(&[rec("A"), rec("B")])?, 2);
        assert_eq!(writer.write(&[])?, 0);
        drop(writer);

        let mut writer = OutputWriter::open(&path, OutputFormat::Jsonl, true, false)?;
        writer.write(&[rec("C")])?;
        assert_eq!(writer.written(), 1);

        let content = read(&path);
        assert_eq!(content.lines().count(), 3);
        let first: Record = serde_json::from_str(content.lines().next().unwrap_or_default())?;
        assert_eq!(first, rec("A"));

        let ids = OutputWriter::scan_ids(&path, OutputFormat::Jsonl)?;
        assert_eq!(ids, HashSet::from(["A".into(), "B".into(), "C".into()]));
        Ok(())
    }

    #[test]
    fn test_raw_is_dropped_when_disabled() -> Result<()> {
        let dir = tmp();
        let path = dir.path().join("records.jsonl");
        let mut writer = OutputWriter::open(&path, OutputFormat::Jsonl, false, false)?;
        writer.write(&[rec("A")])?;
        assert!(!read(&path).contains("\"raw\""));
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() -> Result<()> {
        let dir = tmp();
        let path = dir.path().join("records.jsonl");
        let mut writer = OutputWriter::open(&path, OutputFormat::Jsonl, true, false)?;
        writer.write(&[rec("A"), rec("B")])?;
        drop(writer);

        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(br#"{"id":"C","title":"Pap"#).expect("append");
        drop(file);

        let mut writer = OutputWriter::open(&path, OutputFormat::Jsonl, true, false)?;
        writer.write(&[rec("D")])?;

        let ids = OutputWriter::scan_ids(&path, OutputFormat::Jsonl)?;
        assert_eq!(ids, HashSet::from(["A".into(), "B".into(), "D".into()]));
        assert!(read(&path).ends_with('\n'));
        Ok(())
    }

    #[test]
    fn test_file_with_only_a_torn_line_becomes_empty() -> Result<()> {
        let dir = tmp();
        let path = dir.path().join("records.csv");
        std::fs::write(&path, "id,doi,ti").expect("write");

        let mut writer = OutputWriter::open(&path, OutputFormat::Csv, false, false)?;
        writer.write(&[rec("A")])?;
        assert!(read(&path).starts_with("id,doi,title,"));
        Ok(())
    }

    #[test]
    fn test_csv_header_once_and_one_line_per_record() -> Result<()> {
        let dir = tmp();
        let path = dir.path().join("records.csv");

        let mut multiline = rec("A");
        multiline.title = "Trust\nand\r\nreciprocity".into();
        multiline.abstract_text = Some("Line one.\nLine two, with \"quotes\".".into());

        let mut writer = OutputWriter::open(&path, OutputFormat::Csv, true, false)?;
        writer.write(&[multiline])?;
        drop(writer);
        let mut writer = OutputWriter::open(&path, OutputFormat::Csv, true, false)?;
        writer.write(&[rec("B")])?;

        let content = read(&path);
        assert_eq!(content.lines().count(), 3);
        assert_eq!(content.matches("id,doi,title").count(), 1);
        assert!(content.contains("Trust and reciprocity"));
        assert!(content.contains("Putnam R.; Coleman J."));

        let mut rdr = csv::Reader::from_path(&path)?;
        let rows: Vec<csv::StringRecord> = rdr.records().collect::<std::result::Result<_, _>>()?;
        assert_eq!(&rows[0][13], r#"{"eid":"A"}"#);

        let ids = OutputWriter::scan_ids(&path, OutputFormat::Csv)?;
        assert_eq!(ids, HashSet::from(["A".into(), "B".into()]));
        Ok(())
    }

    #[test]
    fn test_fresh_truncates() -> Result<()> {
        let dir = tmp();
        let path = dir.path().join("records.jsonl");
        let mut writer = OutputWriter::open(&path, OutputFormat::Jsonl, true, false)?;
        writer.write(&[rec("A")])?;
        drop(writer);

        let mut writer = OutputWriter::open(&path, OutputFormat::Jsonl, true, true)?;
        writer.write(&[rec("B")])?;
        let ids = OutputWriter::scan_ids(&path, OutputFormat::Jsonl)?;
        assert_eq!(ids, HashSet::from(["B".into()]));
        Ok(())
    }

    #[test]
    fn test_scan_missing_file() -> Result<()> {
        let dir = tmp();
        let ids = OutputWriter::scan_ids(&dir.path().join("nope.jsonl"), OutputFormat::Jsonl)?;
        assert!(ids.is_empty());
        Ok(())
    }
}
