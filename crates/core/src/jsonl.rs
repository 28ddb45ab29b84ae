//! Streaming JSONL decoder/encoder with large-line support (spec.md §4
//! "JSONL Decoder/Encoder").

use bridge_common::{Error, MetricRecord, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Streams `MetricRecord`s out of a newline-delimited JSON byte stream.
/// Reads by accumulating into a growable buffer rather than a fixed-size
/// line reader, so a single oversized record doesn't truncate or error.
pub struct JsonlDecoder<R> {
    reader: BufReader<R>,
    line_no: u64,
}

impl<R: AsyncRead + Unpin> JsonlDecoder<R> {
    pub fn new(inner: R) -> Self {
        Self { reader: BufReader::new(inner), line_no: 0 }
    }

    /// Read and parse the next record, skipping blank lines. Returns
    /// `Ok(None)` at end of stream. A malformed JSON line is reported as a
    /// `Protocol` error that carries the 1-based line number.
    pub async fn next_record(&mut self) -> Result<Option<MetricRecord>> {
        loop {
            let mut buf = Vec::new();
            let read = self.reader.read_until(b'\n', &mut buf).await?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
                buf.pop();
            }
            if buf.is_empty() {
                continue;
            }
            let record: MetricRecord = serde_json::from_slice(&buf).map_err(|e| {
                Error::Protocol(format!("invalid JSONL at line {}: {}", self.line_no, e))
            })?;
            return Ok(Some(record));
        }
    }

    /// Like [`next_record`](Self::next_record) but returns the raw line
    /// bytes alongside a best-effort parse, for callers (the importer
    /// preflight/stream) that need to count skipped lines instead of
    /// failing the whole stream on one bad line.
    pub async fn next_line(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        loop {
            let mut buf = Vec::new();
            let read = self.reader.read_until(b'\n', &mut buf).await?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
                buf.pop();
            }
            if buf.is_empty() {
                continue;
            }
            return Ok(Some((self.line_no, buf)));
        }
    }
}

/// Streams `MetricRecord`s into a newline-delimited JSON byte sink.
pub struct JsonlEncoder<W> {
    writer: W,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> JsonlEncoder<W> {
    pub fn new(inner: W) -> Self {
        Self { writer: inner, bytes_written: 0 }
    }

    /// Serialize and append one record, returning the number of bytes
    /// (including the trailing newline) just written.
    pub async fn write_record(&mut self, record: &MetricRecord) -> Result<u64> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.bytes_written += line.len() as u64;
        Ok(line.len() as u64)
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_record(name: &str) -> MetricRecord {
        let mut labels = BTreeMap::new();
        labels.insert("__name__".to_string(), name.to_string());
        MetricRecord { labels, values: vec![1.0, 2.0], timestamps: vec![1000, 2000] }
    }

    #[tokio::test]
    async fn round_trips_multiple_records() {
        let mut buf: Vec<u8> = Vec::new();
        {
            let mut enc = JsonlEncoder::new(&mut buf);
            enc.write_record(&sample_record("up")).await.unwrap();
            enc.write_record(&sample_record("down")).await.unwrap();
        }

        let mut dec = JsonlDecoder::new(buf.as_slice());
        let r1 = dec.next_record().await.unwrap().unwrap();
        assert_eq!(r1.metric_name(), "up");
        let r2 = dec.next_record().await.unwrap().unwrap();
        assert_eq!(r2.metric_name(), "down");
        assert!(dec.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skips_blank_lines() {
        let input = b"\n\n".to_vec();
        let mut dec = JsonlDecoder::new(input.as_slice());
        assert!(dec.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reports_line_number_on_malformed_json() {
        let input = b"{\"labels\":{}}\nnot json\n".to_vec();
        let mut dec = JsonlDecoder::new(input.as_slice());
        let err = dec.next_record().await.unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[tokio::test]
    async fn handles_an_oversized_line() {
        let mut labels = BTreeMap::new();
        labels.insert("__name__".to_string(), "up".to_string());
        let big_value = "x".repeat(200_000);
        labels.insert("note".to_string(), big_value);
        let record = MetricRecord { labels, values: vec![1.0], timestamps: vec![1] };

        let mut buf: Vec<u8> = Vec::new();
        JsonlEncoder::new(&mut buf).write_record(&record).await.unwrap();

        let mut dec = JsonlDecoder::new(buf.as_slice());
        let parsed = dec.next_record().await.unwrap().unwrap();
        assert_eq!(parsed.labels.get("note").unwrap().len(), 200_000);
    }
}
