use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

use log::info;

use crate::error::{Error, Result};

/// Writes one text line per synchronized frame.
///
/// Every value is printed with six decimals followed by a single space, and
/// the line ends with `\n`. There is no header.
pub struct RecordWriter<W: Write> {
    sink: Option<W>,
    rows: u64,
}

impl RecordWriter<BufWriter<File>> {
    /// Creates (or truncates) the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)?;
        info!("writing records to {}", path.display());
        Ok(RecordWriter::new(BufWriter::new(file)))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(sink: W) -> Self {
        RecordWriter {
            sink: Some(sink),
            rows: 0,
        }
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_none()
    }

    pub fn write_row(&mut self, primary: &[f64], secondary: &[f64]) -> Result<()> {
        let sink = self.sink.as_mut().ok_or_else(closed)?;
        for value in primary.iter().chain(secondary) {
            write!(sink, "{:.6} ", value)?;
        }
        sink.write_all(b"\n")?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.as_mut().ok_or_else(closed)?.flush()?;
        Ok(())
    }

    /// Flushes and releases the sink. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush()?;
            info!("record sink closed after {} rows", self.rows);
        }
        Ok(())
    }
}

impl<W: Write> Drop for RecordWriter<W> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn closed() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "record sink is closed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMARY: [f64; 8] = [0.0, 1.5, -2.25, 3.125, -4.0, 5.5, -6.75, 9.999999];
    const SECONDARY: [f64; 8] = [-10.0, 10.0, 0.000001, -0.5, 7.0, -8.125, 2.0, -3.0];

    #[test]
    fn row_format() {
        let mut writer = RecordWriter::new(Vec::new());
        writer.write_row(&[1.0, -0.5], &[2.25, 3.0]).unwrap();
        let sink = writer.sink.take().unwrap();
        assert_eq!(
            String::from_utf8(sink).unwrap(),
            "1.000000 -0.500000 2.250000 3.000000 \n"
        );
    }

    #[test]
    fn row_splits_back_into_sixteen_values() {
        let mut writer = RecordWriter::new(Vec::new());
        writer.write_row(&PRIMARY, &SECONDARY).unwrap();
        let text = String::from_utf8(writer.sink.take().unwrap()).unwrap();

        let values: Vec<f64> = text
            .split_whitespace()
            .map(|field| field.parse().unwrap())
            .collect();
        let expected: Vec<f64> = PRIMARY.iter().chain(&SECONDARY).copied().collect();
        assert_eq!(values, expected);
        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let mut writer = RecordWriter::new(Vec::new());
        writer.write_row(&PRIMARY, &SECONDARY).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(writer.is_closed());
        assert_eq!(writer.rows(), 1);
        assert!(matches!(writer.write_row(&PRIMARY, &SECONDARY), Err(Error::Io(_))));
    }

    #[test]
    fn open_truncates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "stale\n").unwrap();

        let mut writer = RecordWriter::open(&path).unwrap();
        writer.write_row(&[1.0], &[2.0]).unwrap();
        writer.close().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1.000000 2.000000 \n");
    }

    #[test]
    fn open_unwritable_path_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("data.txt");
        assert!(matches!(RecordWriter::open(path), Err(Error::Io(_))));
    }
}
