//! Command entry payload codec.
//!
//! Serializes an argv vector (`argv[0]` the command name, `argv[1..]` its
//! arguments) into the opaque byte buffer carried inside a Raft entry's data,
//! and back. Layout: `argc: usize | (len_i: usize, bytes_i: [u8; len_i])*`,
//! using the host's native-endian `usize`, exactly as the on-the-wire
//! argument framing the original command service used.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer truncated while reading argc")]
    TruncatedArgc,
    #[error("buffer truncated while reading argument length")]
    TruncatedLen,
    #[error("buffer truncated while reading argument bytes (wanted {wanted}, had {had})")]
    TruncatedBytes { wanted: usize, had: usize },
    #[error("trailing bytes after decoding {argc} arguments")]
    TrailingBytes { argc: usize },
}

const WORD: usize = std::mem::size_of::<usize>();

/// Encode an argv vector into its on-disk/entry-data byte layout.
pub fn encode_argv(argv: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(WORD + argv.iter().map(|a| WORD + a.len()).sum::<usize>());
    buf.extend_from_slice(&argv.len().to_ne_bytes());
    for arg in argv {
        buf.extend_from_slice(&arg.len().to_ne_bytes());
        buf.extend_from_slice(arg);
    }
    buf
}

/// Decode an argv vector from its on-disk/entry-data byte layout.
pub fn decode_argv(buf: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    if buf.len() < WORD {
        return Err(CodecError::TruncatedArgc);
    }
    let mut pos = 0;
    let argc = usize::from_ne_bytes(buf[pos..pos + WORD].try_into().unwrap());
    pos += WORD;

    let mut argv = Vec::with_capacity(argc);
    for _ in 0..argc {
        if buf.len() < pos + WORD {
            return Err(CodecError::TruncatedLen);
        }
        let len = usize::from_ne_bytes(buf[pos..pos + WORD].try_into().unwrap());
        pos += WORD;

        if buf.len() < pos + len {
            return Err(CodecError::TruncatedBytes {
                wanted: len,
                had: buf.len() - pos,
            });
        }
        argv.push(buf[pos..pos + len].to_vec());
        pos += len;
    }

    if pos != buf.len() {
        return Err(CodecError::TrailingBytes { argc });
    }

    Ok(argv)
}
