use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::media::Fingerprint;

/// Bytes hashed from each end of a resource
pub const SAMPLE_LEN: u64 = 64 * 1024;

/// Fingerprint plus the leading bytes, which double as the readability check
/// and as input for signature sniffing.
#[derive(Debug, Clone)]
pub struct Sample {
    pub fingerprint: Fingerprint,
    pub head: Vec<u8>,
}

fn read_up_to(reader: &mut impl Read, limit: u64) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(limit as usize);
    reader.take(limit).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Sample a file on disk: size plus SHA-256 of its first and last 64 KiB.
pub fn sample_file(path: &Path) -> io::Result<Sample> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();

    let head = read_up_to(&mut file, SAMPLE_LEN)?;
    let mut hasher = Sha256::new();
    hasher.update(&head);

    let head_len = head.len() as u64;
    if size > head_len {
        let tail_start = size.saturating_sub(SAMPLE_LEN).max(head_len);
        file.seek(SeekFrom::Start(tail_start))?;
        let tail = read_up_to(&mut file, SAMPLE_LEN)?;
        hasher.update(&tail);
    }

    Ok(Sample {
        fingerprint: Fingerprint {
            size,
            digest: hex::encode(hasher.finalize()),
        },
        head,
    })
}

/// Sample a stream (an archive entry): SHA-256 of its first 64 KiB and the
/// stored CRC-32. The remainder is drained so the decoder verifies the CRC;
/// a corrupt entry therefore fails here instead of during export.
pub fn sample_stream(reader: &mut impl Read, crc32: u32) -> io::Result<Sample> {
    let head = read_up_to(reader, SAMPLE_LEN)?;
    let rest = io::copy(reader, &mut io::sink())?;

    let mut hasher = Sha256::new();
    hasher.update(&head);
    hasher.update(crc32.to_le_bytes());

    Ok(Sample {
        fingerprint: Fingerprint {
            size: head.len() as u64 + rest,
            digest: hex::encode(hasher.finalize()),
        },
        head,
    })
}
