//! Tab-separated input and output
//!
//! The input format has one header line and one row per binned
//! observation. The first column is a block label (typically the
//! chromosome); a change of label starts a new block, so runs of equal
//! labels form the independent segments of the profile. The remaining
//! columns are integer read counts, with the literal `NA` for missing
//! values.

use std::fs::File;
use std::io;
use std::path::Path;

use ndarray::Array2;

use super::types::CountMatrix;
use crate::error::{HmmError, Result};

/// Missing observations are stored as -1, per the NA convention of the
/// count matrix (any negative entry is missing).
const NA_SENTINEL: i32 = -1;

/// Read a count profile from a tab-separated source.
pub fn read_counts<R: io::Read>(input: R) -> Result<CountMatrix> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(false)
        .from_reader(input);

    let header_len = reader.headers()?.len();
    if header_len < 2 {
        return Err(HmmError::Parse {
            line: 1,
            message: "expected a block-label column and at least one track".to_string(),
        });
    }
    let r = header_len - 1;

    let mut counts: Vec<i32> = Vec::new();
    let mut block_sizes: Vec<usize> = Vec::new();
    let mut block_labels: Vec<String> = Vec::new();
    let mut prev_label: Option<String> = None;

    for (row_no, record) in reader.records().enumerate() {
        let record = record?;
        let line = row_no + 2; // one header line, 1-based

        let label = record
            .get(0)
            .expect("csv guarantees the checked field count")
            .to_string();
        match prev_label {
            Some(ref prev) if *prev == label => {
                *block_sizes.last_mut().expect("non-empty after first row") += 1;
            }
            _ => {
                block_sizes.push(1);
                block_labels.push(label.clone());
                prev_label = Some(label);
            }
        }

        for field in record.iter().skip(1) {
            if field == "NA" {
                counts.push(NA_SENTINEL);
            } else {
                let value: i32 = field.parse().map_err(|_| HmmError::Parse {
                    line,
                    message: format!("invalid count '{field}'"),
                })?;
                counts.push(value);
            }
        }
    }

    if counts.is_empty() {
        return Err(HmmError::Parse {
            line: 1,
            message: "no observations".to_string(),
        });
    }

    CountMatrix::with_labels(counts, r, block_sizes, block_labels)
}

/// Read a count profile from a file path.
pub fn read_counts_path<P: AsRef<Path>>(path: P) -> Result<CountMatrix> {
    read_counts(File::open(path)?)
}

/// Write the decoding results as TSV: block label, Viterbi state and the
/// posterior of each state, one row per observation.
pub fn write_results<W: io::Write>(
    output: W,
    counts: &CountMatrix,
    path: &[usize],
    posteriors: &Array2<f64>,
) -> Result<()> {
    let n = counts.n_rows();
    let m = posteriors.ncols();
    if path.len() != n || posteriors.nrows() != n {
        return Err(HmmError::DimensionMismatch {
            expected: n,
            actual: path.len().min(posteriors.nrows()),
        });
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(output);

    let mut header = vec!["block".to_string(), "state".to_string()];
    header.extend((0..m).map(|i| format!("posterior_{i}")));
    writer.write_record(&header)?;

    for k in 0..n {
        let mut record = vec![counts.label_of_row(k).to_string(), path[k].to_string()];
        record.extend((0..m).map(|i| format!("{:.6}", posteriors[[k, i]])));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "chrom\tctrl\tchip\n\
                          chr1\t10\t0\n\
                          chr1\t10\t0\n\
                          chr2\t0\t0\n\
                          chr2\tNA\t5\n";

    #[test]
    fn test_read_blocks_by_label_run() {
        let counts = read_counts(SAMPLE.as_bytes()).unwrap();
        assert_eq!(counts.n_rows(), 4);
        assert_eq!(counts.n_tracks(), 2);
        assert_eq!(counts.block_sizes(), &[2, 2]);
        assert_eq!(counts.block_labels(), &["chr1", "chr2"]);
    }

    #[test]
    fn test_na_becomes_sentinel() {
        let counts = read_counts(SAMPLE.as_bytes()).unwrap();
        assert_eq!(counts.row(3), &[-1, 5]);
        assert!(counts.row_is_missing(3));
    }

    #[test]
    fn test_repeated_label_later_is_new_block() {
        // Only runs form blocks; a label may reappear.
        let data = "chrom\tctrl\nchr1\t1\nchr2\t2\nchr1\t3\n";
        let counts = read_counts(data.as_bytes()).unwrap();
        assert_eq!(counts.block_sizes(), &[1, 1, 1]);
    }

    #[test]
    fn test_bad_count_reports_line() {
        let data = "chrom\tctrl\nchr1\t1\nchr1\tx\n";
        match read_counts(data.as_bytes()) {
            Err(HmmError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_ragged_row_rejected() {
        let data = "chrom\tctrl\tchip\nchr1\t1\n";
        assert!(read_counts(data.as_bytes()).is_err());
    }

    #[test]
    fn test_write_results_shape() {
        let counts = read_counts(SAMPLE.as_bytes()).unwrap();
        let phi = Array2::from_shape_vec(
            (4, 2),
            vec![0.9, 0.1, 0.8, 0.2, 0.5, 0.5, 0.4, 0.6],
        )
        .unwrap();
        let path = vec![0, 0, 1, 1];
        let mut out = Vec::new();
        write_results(&mut out, &counts, &path, &phi).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "block\tstate\tposterior_0\tposterior_1");
        assert!(lines[1].starts_with("chr1\t0\t0.9"));
    }
}
