use std::io::BufRead;

use crate::split::SplitError;

/// One FASTA entry: the header line and its sequence lines, kept byte for byte.
#[derive(Debug)]
pub struct FastaRecord {
    pub bytes: Vec<u8>,
    /// Number of residues (non-whitespace bytes of the sequence lines).
    pub residues: u64,
}

impl FastaRecord {
    fn new(header: Vec<u8>) -> Self {
        Self {
            bytes: header,
            residues: 0,
        }
    }

    fn push_line(&mut self, line: &[u8]) {
        self.residues += line.iter().filter(|b| !b.is_ascii_whitespace()).count() as u64;
        self.bytes.extend_from_slice(line);
    }
}

/// Streams FASTA records out of a reader, one record at a time.
pub struct FastaReader<R> {
    reader: R,
    line_number: u64,
    next_header: Option<Vec<u8>>,
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

impl<R: BufRead> FastaReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_number: 0,
            next_header: None,
        }
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, SplitError> {
        let mut line = vec![];
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        self.line_number += 1;
        Ok(Some(line))
    }

    pub fn next_record(&mut self) -> Result<Option<FastaRecord>, SplitError> {
        let mut record = match self.next_header.take() {
            Some(header) => FastaRecord::new(header),
            None => loop {
                match self.read_line()? {
                    None => return Ok(None),
                    Some(line) if line.starts_with(b">") => break FastaRecord::new(line),
                    // Blank lines in front of the first record are dropped
                    Some(line) if is_blank(&line) => continue,
                    Some(_) => {
                        return Err(SplitError::Malformed {
                            line: self.line_number,
                            reason: "sequence data before the first FASTA header".to_string(),
                        });
                    }
                }
            },
        };

        loop {
            match self.read_line()? {
                None => return Ok(Some(record)),
                Some(line) if line.starts_with(b">") => {
                    self.next_header = Some(line);
                    return Ok(Some(record));
                }
                Some(line) => record.push_line(&line),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FastaReader;
    use crate::split::SplitError;

    #[test]
    fn test_read_records() {
        let mut reader = FastaReader::new("\n>a desc\nACGT\nAC\n>b\n\n>c\nA C\n".as_bytes());
        let a = reader.next_record().unwrap().unwrap();
        assert_eq!(a.bytes, b">a desc\nACGT\nAC\n");
        assert_eq!(a.residues, 6);
        let b = reader.next_record().unwrap().unwrap();
        assert_eq!(b.bytes, b">b\n\n");
        assert_eq!(b.residues, 0);
        let c = reader.next_record().unwrap().unwrap();
        assert_eq!(c.residues, 2);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_missing_final_newline() {
        let mut reader = FastaReader::new(">a\nACGT".as_bytes());
        let a = reader.next_record().unwrap().unwrap();
        assert_eq!(a.bytes, b">a\nACGT");
        assert_eq!(a.residues, 4);
    }

    #[test]
    fn test_data_before_header() {
        let mut reader = FastaReader::new("\nACGT\n>a\nAC\n".as_bytes());
        match reader.next_record() {
            Err(SplitError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
