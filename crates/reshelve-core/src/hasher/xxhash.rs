use std::fs::{self, File};
use std::hash::Hasher as _;
use std::io::{self, Read};
use std::path::Path;
use twox_hash::XxHash64;

const PARTIAL_HASH_LENGTH: usize = 1024; // 1KB
const CHUNK_LENGTH: usize = 64 * 1024;

pub fn hash_data(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

pub fn hash_str(value: &str) -> u64 {
    hash_data(value.as_bytes())
}

/// Two-tier comparison:
/// 1. Sizes, then a partial hash of the first 1KB to reject most non-matches cheaply
/// 2. Full streaming hash of both files only when the prefixes agree
pub fn files_identical(a: &Path, b: &Path) -> io::Result<bool> {
    let (meta_a, meta_b) = (fs::metadata(a)?, fs::metadata(b)?);
    if !meta_a.is_file() || !meta_b.is_file() || meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    if hash_data(&read_portion(a)?) != hash_data(&read_portion(b)?) {
        return Ok(false);
    }
    if meta_a.len() as usize <= PARTIAL_HASH_LENGTH {
        return Ok(true);
    }

    Ok(hash_file(a)? == hash_file(b)?)
}

fn read_portion(file: &Path) -> io::Result<Vec<u8>> {
    let mut f = File::open(file)?;
    let mut buffer = vec![0; PARTIAL_HASH_LENGTH];
    let mut filled = 0;
    while filled < buffer.len() {
        let n = f.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);
    Ok(buffer)
}

fn hash_file(file: &Path) -> io::Result<u64> {
    let mut f = File::open(file)?;
    let mut hasher = XxHash64::with_seed(0);
    let mut buffer = vec![0; CHUNK_LENGTH];
    loop {
        let n = f.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.write(&buffer[..n]);
    }
    Ok(hasher.finish())
}
