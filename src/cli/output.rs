//! JSON lines record output.
//!
//! Every record becomes one JSON object per line, tagged with its kind in the
//! `type` field. Writes from all workers are serialised through one buffered
//! writer.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use netcap_core::{Record, RecordSink};
use parking_lot::Mutex;

pub struct JsonLinesSink {
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
}

impl JsonLinesSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
        }
    }

    /// Create (or truncate) the output file.
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(Box::new(File::create(path)?)))
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }
}

impl RecordSink for JsonLinesSink {
    fn write(&self, record: &Record) -> io::Result<()> {
        let line = serde_json::to_vec(record)?;
        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.write_all(b"\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcap_core::record::Credentials;
    use std::sync::Arc;

    /// Writer whose contents stay readable after the sink takes it.
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_one_object_per_line() {
        let buffer = Shared::default();
        let sink = JsonLinesSink::new(Box::new(buffer.clone()));
        let credential = Credentials {
            service: "FTP".into(),
            user: "bob".into(),
            ..Default::default()
        };
        sink.write(&Record::Credentials(credential.clone())).unwrap();
        sink.write(&Record::Credentials(credential)).unwrap();
        sink.flush().unwrap();

        let output = String::from_utf8(buffer.0.lock().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["user"], "bob");
        assert!(value["type"].is_string());
    }

    #[test]
    fn test_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let sink = JsonLinesSink::create(&path).unwrap();
        sink.write(&Record::Credentials(Credentials::default())).unwrap();
        sink.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }
}
