//! Archive builders for tests and the simulated release feed.

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Write};

/// A tar archive holding `files` as regular entries.
///
/// Uses GNU headers so paths longer than 100 bytes get a long-name entry.
pub fn tar(files: &[(String, Vec<u8>)]) -> io::Result<Bytes> {
    let mut builder = ::tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = ::tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(::tar::EntryType::Regular);
        builder.append_data(&mut header, path, data.as_slice())?;
    }
    Ok(Bytes::from(builder.into_inner()?))
}

pub fn tar_gz(files: &[(String, Vec<u8>)]) -> io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar(files)?)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// A small frontend bundle: an index page, a script and some platform metadata.
pub fn sample_frontend(version: &str) -> Vec<(String, Vec<u8>)> {
    vec![
        (
            "./index.html".to_string(),
            format!("<html><body>vault {}</body></html>", version).into_bytes(),
        ),
        (
            "./assets/app.js".to_string(),
            format!("console.log('vault {}');", version).repeat(64).into_bytes(),
        ),
        ("./._index.html".to_string(), b"resource fork".to_vec()),
    ]
}

/// Bytes that look enough like a module for the simulated platform
pub fn sample_module(version: &str, len: usize) -> Bytes {
    let mut module = b"\0asm\x01\0\0\0".to_vec();
    let mut seed = version.bytes().fold(7u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    while module.len() < len {
        seed = seed.wrapping_mul(13).wrapping_add(17);
        module.push(seed);
    }
    Bytes::from(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tar_roundtrips_through_tar_reader() {
        let long = format!("assets/{}.js", "x".repeat(150));
        let archive = tar(&[(long.clone(), b"hello".to_vec())]).unwrap();

        let mut reader = ::tar::Archive::new(archive.as_ref());
        let paths: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(paths, vec![long]);
    }

    #[test]
    fn test_sample_module_is_deterministic() {
        assert_eq!(sample_module("v1", 100), sample_module("v1", 100));
        assert_ne!(sample_module("v1", 100), sample_module("v2", 100));
        assert_eq!(sample_module("v1", 100).len(), 100);
    }
}
