//! NPY array files readable by numpy.
//!
//! Feature matrices are stored as 2-D `<f8` and labels as 1-D `<i8`, C order.
//! The reader also accepts version 2.0 headers and any little-endian integer
//! or float dtype for labels.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const ALIGNMENT: usize = 64;

#[derive(Debug, Error)]
pub enum NpyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not an NPY file")]
    BadMagic,
    #[error("unsupported NPY version {0}.{1}")]
    UnsupportedVersion(u8, u8),
    #[error("malformed header: {0}")]
    Header(String),
    #[error("unsupported dtype {0:?}")]
    UnsupportedDtype(String),
    #[error("Fortran-ordered arrays are not supported")]
    FortranOrder,
    #[error("expected a {expected}-D array, found shape {found:?}")]
    Dimensions { expected: usize, found: Vec<usize> },
    #[error("data holds {found} bytes, shape needs {expected}")]
    DataLength { expected: usize, found: usize },
    #[error("matrix rows differ in width (row {row})")]
    RaggedMatrix { row: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dtype {
    F8,
    F4,
    I8,
    I4,
    I2,
    I1,
    U1,
    Bool,
}

impl Dtype {
    fn parse(descr: &str) -> Result<Self, NpyError> {
        match descr {
            "<f8" => Ok(Dtype::F8),
            "<f4" => Ok(Dtype::F4),
            "<i8" => Ok(Dtype::I8),
            "<i4" => Ok(Dtype::I4),
            "<i2" => Ok(Dtype::I2),
            "|i1" => Ok(Dtype::I1),
            "|u1" => Ok(Dtype::U1),
            "|b1" => Ok(Dtype::Bool),
            other => Err(NpyError::UnsupportedDtype(other.to_string())),
        }
    }

    fn size(&self) -> usize {
        match self {
            Dtype::F8 | Dtype::I8 => 8,
            Dtype::F4 | Dtype::I4 => 4,
            Dtype::I2 => 2,
            Dtype::I1 | Dtype::U1 | Dtype::Bool => 1,
        }
    }

    fn decode(&self, bytes: &[u8]) -> f64 {
        match self {
            Dtype::F8 => f64::from_le_bytes(fixed(bytes)),
            Dtype::F4 => f64::from(f32::from_le_bytes(fixed(bytes))),
            Dtype::I8 => i64::from_le_bytes(fixed(bytes)) as f64,
            Dtype::I4 => f64::from(i32::from_le_bytes(fixed(bytes))),
            Dtype::I2 => f64::from(i16::from_le_bytes(fixed(bytes))),
            Dtype::I1 => f64::from(bytes[0] as i8),
            Dtype::U1 | Dtype::Bool => f64::from(bytes[0]),
        }
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

struct Header {
    dtype: Dtype,
    shape: Vec<usize>,
}

/// Write a row-major `<f8` matrix of shape `(rows.len(), width)`.
pub fn write_matrix<P: AsRef<Path>>(path: P, rows: &[Vec<f64>]) -> Result<(), NpyError> {
    let width = rows.first().map_or(0, Vec::len);
    if let Some(row) = rows.iter().position(|r| r.len() != width) {
        return Err(NpyError::RaggedMatrix { row });
    }

    let mut writer = BufWriter::new(File::create(path)?);
    write_header(&mut writer, "<f8", &format!("({}, {})", rows.len(), width))?;
    for row in rows {
        for value in row {
            writer.write_all(&value.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Write binary labels as a 1-D `<i8` array.
pub fn write_labels<P: AsRef<Path>>(path: P, labels: &[u8]) -> Result<(), NpyError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_header(&mut writer, "<i8", &format!("({},)", labels.len()))?;
    for &label in labels {
        writer.write_all(&i64::from(label).to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a 2-D numeric array into rows of `f64`.
pub fn read_matrix<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<f64>>, NpyError> {
    let (header, data) = read_file(path.as_ref())?;
    if header.shape.len() != 2 {
        return Err(NpyError::Dimensions {
            expected: 2,
            found: header.shape,
        });
    }
    let (n_rows, width) = (header.shape[0], header.shape[1]);
    let size = header.dtype.size();

    let rows = if width == 0 {
        vec![Vec::new(); n_rows]
    } else {
        data.chunks_exact(width * size)
            .map(|row| row.chunks_exact(size).map(|b| header.dtype.decode(b)).collect())
            .collect()
    };
    Ok(rows)
}

/// Read a 1-D array of labels; every element must be 0 or 1.
pub fn read_labels<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, NpyError> {
    let (header, data) = read_file(path.as_ref())?;
    if header.shape.len() != 1 {
        return Err(NpyError::Dimensions {
            expected: 1,
            found: header.shape,
        });
    }
    let size = header.dtype.size();
    data.chunks_exact(size)
        .map(|b| {
            let value = header.dtype.decode(b);
            if value == 0.0 {
                Ok(0)
            } else if value == 1.0 {
                Ok(1)
            } else {
                Err(NpyError::Header(format!("label value {value} is not 0 or 1")))
            }
        })
        .collect()
}

fn write_header<W: Write>(writer: &mut W, descr: &str, shape: &str) -> Result<(), NpyError> {
    let mut dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr, shape
    );
    // magic(6) + version(2) + u16 length(2), then the dict padded so the
    // data starts on an aligned offset and the header ends in a newline
    let unpadded = MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (ALIGNMENT - unpadded % ALIGNMENT) % ALIGNMENT;
    dict.extend(std::iter::repeat(' ').take(padding));
    dict.push('\n');

    let header_len = u16::try_from(dict.len())
        .map_err(|_| NpyError::Header("header too long for version 1.0".into()))?;

    writer.write_all(MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&header_len.to_le_bytes())?;
    writer.write_all(dict.as_bytes())?;
    Ok(())
}

fn read_file(path: &Path) -> Result<(Header, Vec<u8>), NpyError> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(NpyError::BadMagic);
    }

    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    let header_len = match version {
        [1, 0] => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len)?;
            usize::from(u16::from_le_bytes(len))
        }
        [2, 0] | [3, 0] => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            u32::from_le_bytes(len) as usize
        }
        [major, minor] => return Err(NpyError::UnsupportedVersion(major, minor)),
    };

    let mut raw_header = vec![0u8; header_len];
    reader.read_exact(&mut raw_header)?;
    let text = String::from_utf8(raw_header)
        .map_err(|_| NpyError::Header("header is not valid text".into()))?;
    let header = parse_header(&text)?;

    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;

    let expected = header.shape.iter().product::<usize>() * header.dtype.size();
    if data.len() != expected {
        return Err(NpyError::DataLength {
            expected,
            found: data.len(),
        });
    }

    Ok((header, data))
}

fn parse_header(text: &str) -> Result<Header, NpyError> {
    let descr = dict_value(text, "descr")?;
    let descr = descr.trim_matches(|c| c == '\'' || c == '"');
    let dtype = Dtype::parse(descr)?;

    match dict_value(text, "fortran_order")? {
        "False" => {}
        "True" => return Err(NpyError::FortranOrder),
        other => return Err(NpyError::Header(format!("fortran_order = {other}"))),
    }

    let shape_text = dict_value(text, "shape")?;
    let inner = shape_text
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| NpyError::Header(format!("shape {shape_text}")))?;
    let shape = inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| NpyError::Header(format!("shape dimension {s:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Header { dtype, shape })
}

/// Raw text of `key`'s value in the header dict; tuples are returned with parens.
fn dict_value<'a>(text: &'a str, key: &str) -> Result<&'a str, NpyError> {
    let missing = || NpyError::Header(format!("missing key {key:?}"));
    let quoted = format!("'{key}'");
    let start = text.find(&quoted).ok_or_else(missing)? + quoted.len();
    let rest = text[start..].trim_start();
    let rest = rest.strip_prefix(':').ok_or_else(missing)?.trim_start();

    let end = if rest.starts_with('(') {
        rest.find(')').map(|i| i + 1)
    } else {
        rest.find([',', '}'])
    }
    .ok_or_else(missing)?;

    Ok(rest[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_layout_matches_numpy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X_train.npy");
        write_matrix(&path, &[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..6], MAGIC);
        assert_eq!(&bytes[6..8], &[1, 0]);
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % ALIGNMENT, 0);
        assert_eq!(bytes[9 + header_len], b'\n');
        let header = std::str::from_utf8(&bytes[10..10 + header_len]).unwrap();
        assert!(header.contains("'shape': (2, 3)"));
        assert_eq!(bytes.len(), 10 + header_len + 6 * 8);

        let rows = read_matrix(&path).unwrap();
        assert_eq!(rows[1], vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_labels_use_one_dimensional_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("y_train.npy");
        write_labels(&path, &[0, 1, 1, 0]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        let header = std::str::from_utf8(&bytes[10..10 + header_len]).unwrap();
        assert!(header.contains("'descr': '<i8'"));
        assert!(header.contains("'shape': (4,)"));

        assert_eq!(read_labels(&path).unwrap(), vec![0, 1, 1, 0]);
    }

    #[test]
    fn test_reads_float_labels_written_by_numpy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("y.npy");
        let mut file = File::create(&path).unwrap();
        write_header(&mut file, "<f8", "(3,)").unwrap();
        for value in [0.0f64, 1.0, 0.0] {
            file.write_all(&value.to_le_bytes()).unwrap();
        }
        drop(file);

        assert_eq!(read_labels(&path).unwrap(), vec![0, 1, 0]);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.npy");
        std::fs::write(&path, b"PK\x03\x04 not numpy at all").unwrap();
        assert!(matches!(read_matrix(&path), Err(NpyError::BadMagic)));
    }

    #[test]
    fn test_rejects_truncated_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.npy");
        let mut file = File::create(&path).unwrap();
        write_header(&mut file, "<f8", "(2, 2)").unwrap();
        file.write_all(&1.0f64.to_le_bytes()).unwrap();
        drop(file);

        assert!(matches!(
            read_matrix(&path),
            Err(NpyError::DataLength {
                expected: 32,
                found: 8
            })
        ));
    }

    #[test]
    fn test_rejects_fortran_order_and_unknown_dtype() {
        assert!(matches!(
            parse_header("{'descr': '<f8', 'fortran_order': True, 'shape': (2, 2), }"),
            Err(NpyError::FortranOrder)
        ));
        assert!(matches!(
            parse_header("{'descr': '>f8', 'fortran_order': False, 'shape': (2,), }"),
            Err(NpyError::UnsupportedDtype(_))
        ));
    }

    #[test]
    fn test_rejects_ragged_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.npy");
        assert!(matches!(
            write_matrix(&path, &[vec![1.0, 2.0], vec![3.0]]),
            Err(NpyError::RaggedMatrix { row: 1 })
        ));
    }
}
