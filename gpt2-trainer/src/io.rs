use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::{Error, Result};

/// Opens a file for buffered reading, decompressing by extension
/// (.gz, .zst, .zstd).
pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let reader: Box<dyn Read> = match extension.as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(file)),
        "zst" | "zstd" => Box::new(zstd::Decoder::new(file)?),
        _ => Box::new(file),
    };

    Ok(Box::new(BufReader::new(reader)))
}

pub fn read_lines<P: AsRef<Path>>(path: P) -> Result<impl Iterator<Item = Result<String>>> {
    let reader = open_file(path)?;
    Ok(reader.lines().map(|r| r.map_err(Into::into)))
}

/// Reads the string `field` of every record in a JSON-lines file. Blank
/// lines are skipped.
pub fn read_jsonl_texts<P: AsRef<Path>>(path: P, field: &str) -> Result<Vec<String>> {
    let path = path.as_ref();
    let mut texts = Vec::new();
    for (line_no, line) in read_lines(path)?.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: serde_json::Value = serde_json::from_str(&line)?;
        let text = record.get(field).and_then(|v| v.as_str()).ok_or_else(|| {
            Error::Config(format!(
                "{}:{}: missing string field {:?}",
                path.display(),
                line_no + 1,
                field
            ))
        })?;
        texts.push(text.to_string());
    }
    Ok(texts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const JSONL: &[u8] = b"{\"text\": \"hello\"}\n\n{\"text\": \"world\", \"id\": 2}\n";

    #[test]
    fn test_read_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        std::fs::write(&path, JSONL).unwrap();

        let texts = read_jsonl_texts(&path, "text").unwrap();
        assert_eq!(texts, vec!["hello", "world"]);
    }

    #[test]
    fn test_read_gzip_file() {
        use flate2::Compression;
        use flate2::write::GzEncoder;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl.gz");

        let file = File::create(&path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(JSONL).unwrap();
        encoder.finish().unwrap();

        let texts = read_jsonl_texts(&path, "text").unwrap();
        assert_eq!(texts, vec!["hello", "world"]);
    }

    #[test]
    fn test_read_zstd_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl.zst");

        let file = File::create(&path).unwrap();
        let mut encoder = zstd::Encoder::new(file, 0).unwrap();
        encoder.write_all(JSONL).unwrap();
        encoder.finish().unwrap();

        let lines: Vec<String> = read_lines(&path).unwrap().map(|l| l.unwrap()).collect();
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_missing_field_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"text\": \"ok\"}\n{\"body\": \"no\"}\n").unwrap();

        let err = read_jsonl_texts(&path, "text").unwrap_err();
        assert!(err.to_string().contains(":2:"), "{err}");
    }
}
