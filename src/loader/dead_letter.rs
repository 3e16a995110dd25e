//! Sink for records that exhausted their retry policy.

use super::source::{Header, Record};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

const ERROR_COLUMN: &str = "error";

/// Collects rejected records, optionally writing them to a CSV file with the
/// record's columns followed by an `error` column.
pub struct DeadLetter {
    writer: Mutex<Option<csv::Writer<Box<dyn Write + Send>>>>,
    rejected: AtomicUsize,
}

impl DeadLetter {
    /// Count and log rejects without keeping them.
    pub fn discard() -> Self {
        Self {
            writer: Mutex::new(None),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn to_path(path: &Path, header: &Header) -> Result<Self, csv::Error> {
        let file = File::create(path)?;
        Self::to_writer(Box::new(file), header)
    }

    pub fn to_writer(writer: Box<dyn Write + Send>, header: &Header) -> Result<Self, csv::Error> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(header.columns().iter().map(String::as_str).chain([ERROR_COLUMN]))?;

        Ok(Self {
            writer: Mutex::new(Some(writer)),
            rejected: AtomicUsize::new(0),
        })
    }

    pub fn reject(&self, record: &Record, reason: &str) -> Result<(), csv::Error> {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        log::warn!("record {} rejected: {}", record.line, reason);

        let mut guard = self.writer.lock();
        if let Some(writer) = guard.as_mut() {
            writer.write_record(record.fields.iter().map(String::as_str).chain([reason]))?;
        }
        Ok(())
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> io::Result<()> {
        match self.writer.lock().as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Default for DeadLetter {
    fn default() -> Self {
        Self::discard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Write handle onto a buffer the test can inspect afterwards.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn rejected_rows_carry_their_error() {
        let buf = SharedBuf::default();
        let header = Header::new(["id", "name"]);
        let sink = DeadLetter::to_writer(Box::new(buf.clone()), &header).unwrap();

        sink.reject(&Record::new(4, vec!["4".into(), "d".into()]), "duplicate key")
            .unwrap();
        sink.flush().unwrap();

        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert_eq!(text, "id,name,error\n4,d,duplicate key\n");
        assert_eq!(sink.rejected(), 1);
    }

    #[test]
    fn discard_only_counts() {
        let sink = DeadLetter::discard();
        sink.reject(&Record::new(1, vec![]), "bad").unwrap();
        sink.reject(&Record::new(2, vec![]), "bad").unwrap();
        assert_eq!(sink.rejected(), 2);
        sink.flush().unwrap();
    }

    #[test]
    fn file_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rejects.csv");
        let sink = DeadLetter::to_path(&path, &Header::new(["a"])).unwrap();
        sink.reject(&Record::new(1, vec!["x,y".into()]), "too long").unwrap();
        sink.flush().unwrap();
        drop(sink);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "a,error\n\"x,y\",too long\n");
    }
}
