//! Compressor and checksum adapters.
//!
//! Both are optional host slots. The shipped implementations are zlib
//! (via `flate2`) and CRC-32 (via `crc32fast`); anything implementing the
//! traits can be substituted, as the wire format only records *that*
//! compression was applied, not which algorithm.

use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

/// Compresses and decompresses the command region of outgoing datagrams.
///
/// The datagram header is never passed through the compressor.
pub trait Compressor: Send {
    /// Compresses `input` into `output`, bounded by `limit` bytes.
    ///
    /// Returns the compressed size, or 0 when compression failed or would
    /// not fit within `limit`.
    fn compress(&mut self, input: &[u8], output: &mut [u8], limit: usize) -> usize;

    /// Decompresses `input` into `output`.
    ///
    /// Returns the decompressed size, or 0 on failure.
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> usize;
}

/// Zlib compressor over the command region.
#[derive(Debug, Default)]
pub struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn compress(&mut self, input: &[u8], output: &mut [u8], limit: usize) -> usize {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(input.len()), Compression::default());
        if encoder.write_all(input).is_err() {
            return 0;
        }
        let compressed = match encoder.finish() {
            Ok(bytes) => bytes,
            Err(_) => return 0,
        };
        if compressed.len() > limit || compressed.len() > output.len() {
            return 0;
        }
        output[..compressed.len()].copy_from_slice(&compressed);
        compressed.len()
    }

    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> usize {
        let mut decoder = ZlibDecoder::new(input);
        let mut decompressed = Vec::with_capacity(output.len());
        match decoder.read_to_end(&mut decompressed) {
            Ok(_) if decompressed.len() <= output.len() => {
                output[..decompressed.len()].copy_from_slice(&decompressed);
                decompressed.len()
            }
            _ => 0,
        }
    }
}

/// Computes the checksum word carried in the datagram header.
pub trait Checksum: Send {
    /// Returns the checksum over the complete datagram bytes.
    ///
    /// The caller has already substituted the connect id (or 0) into the
    /// on-wire checksum slot before invoking this.
    fn checksum(&mut self, data: &[u8]) -> u32;
}

/// CRC-32 checksum.
#[derive(Debug, Default)]
pub struct Crc32Checksum;

impl Checksum for Crc32Checksum {
    fn checksum(&mut self, data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }
}
