use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const ZIP_MAGIC: [&[u8; 4]; 2] = [b"PK\x03\x04", b"PK\x05\x06"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    Plain,
    ZipArchive,
}

/// Zip detection by local-header or empty-archive magic; files too short to
/// carry a header fall back to the extension.
pub fn classify(path: &Path) -> io::Result<EntryClass> {
    let mut head = [0u8; 4];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled == head.len() {
        if ZIP_MAGIC.iter().any(|magic| **magic == head) {
            return Ok(EntryClass::ZipArchive);
        }
        return Ok(EntryClass::Plain);
    }

    let by_extension = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);
    Ok(if by_extension {
        EntryClass::ZipArchive
    } else {
        EntryClass::Plain
    })
}
