//! Drop/recover of a form-factor matrix to and from disk.
//!
//! Little-endian binary layout:
//!
//! | bytes | field                          |
//! |-------|--------------------------------|
//! | 8     | magic `b"HEMIFF\0\0"`          |
//! | 4     | format version (`u32`)         |
//! | 8     | fingerprint patch count (`u64`)|
//! | 8     | fingerprint geometry hash      |
//! | 8     | matrix dimension `n` (`u64`)   |
//! | 4·n²  | entries, row-major `f32`       |
//!
//! Entries are written bit-exactly, so a recovered matrix is identical to
//! the dropped one.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};

use super::error::RadiosityError;
use super::matrix::FormFactorMatrix;
use super::registry::GeometryFingerprint;

const MAGIC: [u8; 8] = *b"HEMIFF\0\0";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 8 + 4 + 8 + 8 + 8;

/// Writes `matrix` together with the fingerprint of the geometry it belongs to.
pub fn drop_matrix(
    matrix: &FormFactorMatrix,
    fingerprint: GeometryFingerprint,
    path: &Path,
) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create matrix file: {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let write = |w: &mut BufWriter<File>| -> std::io::Result<()> {
        w.write_all(&MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&fingerprint.patch_count.to_le_bytes())?;
        w.write_all(&fingerprint.geometry_hash.to_le_bytes())?;
        w.write_all(&(matrix.dim() as u64).to_le_bytes())?;
        for &f in matrix.as_slice() {
            w.write_all(&f.to_le_bytes())?;
        }
        w.flush()
    };
    write(&mut writer)
        .with_context(|| format!("Failed to write matrix file: {}", path.display()))?;

    log::info!(
        "Dropped {n}x{n} form-factor matrix to {}",
        path.display(),
        n = matrix.dim()
    );
    Ok(())
}

/// Reads a matrix back, refusing it unless it was sampled from `expected`.
///
/// Fails with [`RadiosityError::FingerprintMismatch`] for a stale file and
/// [`RadiosityError::BadMatrixFile`] for anything that is not a complete
/// matrix file of this format.
pub fn recover_matrix(path: &Path, expected: &GeometryFingerprint) -> Result<FormFactorMatrix> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open matrix file: {}", path.display()))?;
    let file_len = file
        .metadata()
        .with_context(|| format!("Failed to stat matrix file: {}", path.display()))?
        .len();
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    read_exact(&mut reader, &mut magic, "magic")?;
    if magic != MAGIC {
        return Err(RadiosityError::BadMatrixFile(format!("bad magic {magic:02x?}")).into());
    }
    let version = u32::from_le_bytes(read_array(&mut reader, "version")?);
    if version != VERSION {
        return Err(RadiosityError::BadMatrixFile(format!(
            "unsupported version {version}"
        ))
        .into());
    }

    let found = GeometryFingerprint {
        patch_count: u64::from_le_bytes(read_array(&mut reader, "patch count")?),
        geometry_hash: u64::from_le_bytes(read_array(&mut reader, "geometry hash")?),
    };
    if found != *expected {
        return Err(RadiosityError::FingerprintMismatch {
            expected: *expected,
            found,
        }
        .into());
    }

    let dim = u64::from_le_bytes(read_array(&mut reader, "dimension")?);
    if dim != found.patch_count {
        return Err(RadiosityError::BadMatrixFile(format!(
            "dimension {dim} does not match patch count {}",
            found.patch_count
        ))
        .into());
    }
    let expected_len = dim
        .checked_mul(dim)
        .and_then(|e| e.checked_mul(4))
        .and_then(|b| b.checked_add(HEADER_LEN));
    if expected_len != Some(file_len) {
        return Err(RadiosityError::BadMatrixFile(format!(
            "{file_len} bytes on disk for a {dim}x{dim} matrix"
        ))
        .into());
    }

    let n = usize::try_from(dim).context("Matrix dimension does not fit in memory")?;
    let mut data = Vec::with_capacity(n * n);
    let mut buf = [0u8; 4];
    for _ in 0..n * n {
        read_exact(&mut reader, &mut buf, "entries")?;
        data.push(f32::from_le_bytes(buf));
    }

    log::info!("Recovered {n}x{n} form-factor matrix from {}", path.display());
    FormFactorMatrix::from_raw(n, data)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], field: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            anyhow::Error::from(RadiosityError::BadMatrixFile(format!("truncated {field}")))
        } else {
            anyhow::Error::from(e).context(format!("Failed to read matrix {field}"))
        }
    })
}

fn read_array<R: Read, const N: usize>(reader: &mut R, field: &str) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    read_exact(reader, &mut buf, field)?;
    Ok(buf)
}
