//! Block pre-processing.
//!
//! Downloaded raw blocks are reduced to the 80-byte header plus aggregate
//! counts before they reach the controller; nothing else from the block
//! body is retained.

use std::mem;
use thiserror::Error;

/// Size of a serialized block header.
pub const HEADER_SIZE: usize = 80;

/// Raw 80-byte block header.
pub type RawHeader = [u8; HEADER_SIZE];

/// Summary of a downloaded block: header plus aggregate counts.
///
/// Immutable after construction; produced by a download task and handed
/// to the controller behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreProcessedBlock {
    pub height: u64,
    /// Serialized size of the full block on the wire.
    pub size_bytes: usize,
    pub header: RawHeader,
    pub tx_count: usize,
    pub input_count: usize,
    pub output_count: usize,
    /// Estimated resident size of this summary.
    pub in_memory_bytes: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockParseError {
    #[error("block truncated reading {0}")]
    Truncated(&'static str),
    #[error("varint too large reading {0}")]
    Oversized(&'static str),
}

/// Turns raw block bytes into a [`PreProcessedBlock`].
pub trait BlockParser: Send + Sync {
    fn parse(&self, height: u64, raw: &[u8]) -> Result<PreProcessedBlock, BlockParseError>;
}

/// Parser for the Bitcoin wire format, including BIP-144 witness
/// serialization. Scripts and witness items are skipped, not decoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireBlockParser;

impl BlockParser for WireBlockParser {
    fn parse(&self, height: u64, raw: &[u8]) -> Result<PreProcessedBlock, BlockParseError> {
        let mut cur = Cursor::new(raw);

        let header_bytes = cur.take(HEADER_SIZE, "header")?;
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(header_bytes);

        let tx_count = cur.varint("tx count")? as usize;
        let mut input_count = 0usize;
        let mut output_count = 0usize;

        for _ in 0..tx_count {
            cur.take(4, "tx version")?;

            // BIP-144: a zero input count here is the segwit marker.
            let mut n_in = cur.varint("input count")?;
            let mut segwit = false;
            if n_in == 0 {
                let flag = cur.take(1, "segwit flag")?[0];
                if flag == 0 {
                    return Err(BlockParseError::Truncated("segwit flag"));
                }
                segwit = true;
                n_in = cur.varint("input count")?;
            }

            for _ in 0..n_in {
                cur.take(36, "outpoint")?;
                let script_len = cur.varint("script length")? as usize;
                cur.take(script_len, "script")?;
                cur.take(4, "sequence")?;
            }
            input_count += n_in as usize;

            let n_out = cur.varint("output count")?;
            for _ in 0..n_out {
                cur.take(8, "output value")?;
                let script_len = cur.varint("script length")? as usize;
                cur.take(script_len, "script")?;
            }
            output_count += n_out as usize;

            if segwit {
                for _ in 0..n_in {
                    let n_items = cur.varint("witness count")?;
                    for _ in 0..n_items {
                        let item_len = cur.varint("witness item length")? as usize;
                        cur.take(item_len, "witness item")?;
                    }
                }
            }

            cur.take(4, "lock time")?;
        }

        Ok(PreProcessedBlock {
            height,
            size_bytes: raw.len(),
            header,
            tx_count,
            input_count,
            output_count,
            in_memory_bytes: mem::size_of::<PreProcessedBlock>(),
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], BlockParseError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(BlockParseError::Oversized(what))?;
        if end > self.buf.len() {
            return Err(BlockParseError::Truncated(what));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Bitcoin CompactSize integer.
    fn varint(&mut self, what: &'static str) -> Result<u64, BlockParseError> {
        let first = self.take(1, what)?[0];
        let value = match first {
            0xfd => {
                let b = self.take(2, what)?;
                u16::from_le_bytes([b[0], b[1]]) as u64
            }
            0xfe => {
                let b = self.take(4, what)?;
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64
            }
            0xff => {
                let b = self.take(8, what)?;
                u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
            n => n as u64,
        };
        // Sanity cap: nothing in a block legitimately counts past 2^32.
        if value > u32::MAX as u64 {
            return Err(BlockParseError::Oversized(what));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_varint(buf: &mut Vec<u8>, v: u64) {
        match v {
            0..=0xfc => buf.push(v as u8),
            0xfd..=0xffff => {
                buf.push(0xfd);
                buf.extend_from_slice(&(v as u16).to_le_bytes());
            }
            _ => {
                buf.push(0xfe);
                buf.extend_from_slice(&(v as u32).to_le_bytes());
            }
        }
    }

    fn push_tx(buf: &mut Vec<u8>, n_in: usize, n_out: usize, segwit: bool) {
        buf.extend_from_slice(&1u32.to_le_bytes()); // version
        if segwit {
            buf.push(0x00);
            buf.push(0x01);
        }
        push_varint(buf, n_in as u64);
        for _ in 0..n_in {
            buf.extend_from_slice(&[0u8; 36]); // outpoint
            push_varint(buf, 2);
            buf.extend_from_slice(&[0x51, 0x52]); // script
            buf.extend_from_slice(&0xffffffffu32.to_le_bytes()); // sequence
        }
        push_varint(buf, n_out as u64);
        for _ in 0..n_out {
            buf.extend_from_slice(&1000u64.to_le_bytes());
            push_varint(buf, 1);
            buf.push(0x51);
        }
        if segwit {
            for _ in 0..n_in {
                push_varint(buf, 1); // one witness item
                push_varint(buf, 3);
                buf.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
            }
        }
        buf.extend_from_slice(&0u32.to_le_bytes()); // lock time
    }

    fn make_block(txs: &[(usize, usize, bool)]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];
        push_varint(&mut buf, txs.len() as u64);
        for &(n_in, n_out, segwit) in txs {
            push_tx(&mut buf, n_in, n_out, segwit);
        }
        buf
    }

    #[test]
    fn test_parse_legacy_block() {
        let raw = make_block(&[(1, 2, false), (3, 1, false)]);
        let ppb = WireBlockParser.parse(7, &raw).unwrap();

        assert_eq!(ppb.height, 7);
        assert_eq!(ppb.size_bytes, raw.len());
        assert_eq!(ppb.tx_count, 2);
        assert_eq!(ppb.input_count, 4);
        assert_eq!(ppb.output_count, 3);
    }

    #[test]
    fn test_parse_segwit_block() {
        let raw = make_block(&[(2, 2, true)]);
        let ppb = WireBlockParser.parse(0, &raw).unwrap();

        assert_eq!(ppb.tx_count, 1);
        assert_eq!(ppb.input_count, 2);
        assert_eq!(ppb.output_count, 2);
    }

    #[test]
    fn test_parse_rejects_truncated_header() {
        let err = WireBlockParser.parse(0, &[0u8; 79]).unwrap_err();
        assert_eq!(err, BlockParseError::Truncated("header"));
    }

    #[test]
    fn test_parse_rejects_truncated_tx() {
        let mut raw = make_block(&[(1, 1, false)]);
        raw.truncate(raw.len() - 2);
        assert!(WireBlockParser.parse(0, &raw).is_err());
    }

    #[test]
    fn test_varint_encodings() {
        let mut buf = vec![0u8; HEADER_SIZE];
        push_varint(&mut buf, 300); // forces the 0xfd form for tx count
        for _ in 0..300 {
            push_tx(&mut buf, 1, 1, false);
        }
        let ppb = WireBlockParser.parse(0, &buf).unwrap();
        assert_eq!(ppb.tx_count, 300);
        assert_eq!(ppb.input_count, 300);
    }
}
