//! Streaming MD5. Never buffers a whole file in memory.

use std::io::Read;
use std::path::Path;

const CHUNK_SIZE: usize = 64 * 1024;

pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(hex::encode(ctx.compute().0))
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(md5::compute(bytes).0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello\n").unwrap();
        assert_eq!(hash_file(&path).unwrap(), "b1946ac92492d2347c6235b4d2611184");
    }

    #[test]
    fn bytes_matches_file_hash() {
        assert_eq!(hash_bytes(b"hello\n"), "b1946ac92492d2347c6235b4d2611184");
    }

    #[test]
    fn large_file_streams_without_full_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data = vec![0xABu8; CHUNK_SIZE * 3 + 17];
        std::fs::write(&path, &data).unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
    }
}
