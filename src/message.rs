// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Typed messages between coordinators. A [Frame] is the unit handed to
//! the socket layer: an addressed byte buffer holding a sequence of
//! [Piece]s. Each piece is a fixed-width little-endian header
//! `(kind:u16, table:u16, partition:u16, len:u32)` followed by a
//! bincode-encoded payload struct.
//!
//! Requests echo the read- or write-set offset of the access they serve,
//! so the matching response handler can find the waiting [crate::RwKey]
//! slot without any per-request state on the sender.

use crate::Error;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::io::Cursor;

/// Dense message-type tags; handler dispatch indexes a table by this.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceKind {
    SearchRequest = 0,
    SearchResponse = 1,
    LockRequest = 2,
    LockResponse = 3,
    ReadValidationRequest = 4,
    ReadValidationResponse = 5,
    AbortRequest = 6,
    WriteRequest = 7,
    WriteResponse = 8,
    ReplicationRequest = 9,
    ReplicationResponse = 10,
    ReleaseLockRequest = 11,
}

pub const PIECE_KINDS: usize = 12;

impl TryFrom<u16> for PieceKind {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self, Error> {
        use PieceKind::*;
        Ok(match v {
            0 => SearchRequest,
            1 => SearchResponse,
            2 => LockRequest,
            3 => LockResponse,
            4 => ReadValidationRequest,
            5 => ReadValidationResponse,
            6 => AbortRequest,
            7 => WriteRequest,
            8 => WriteResponse,
            9 => ReplicationRequest,
            10 => ReplicationResponse,
            11 => ReleaseLockRequest,
            other => return Err(Error::UnknownPieceKind(other)),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub key: Vec<u8>,
    pub key_offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub key_offset: u32,
    pub tid: u64,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub key: Vec<u8>,
    pub write_offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResponse {
    pub write_offset: u32,
    pub tid: u64,
    pub success: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadValidationRequest {
    pub key: Vec<u8>,
    pub read_offset: u32,
    pub snapshot: u64,
    pub commit_ts: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadValidationResponse {
    pub read_offset: u32,
    /// The word observed by the validator on success, so the requester can
    /// refresh its snapshot after a permissible wts advance.
    pub tid: u64,
    pub success: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortRequest {
    pub key: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub commit_wts: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationResponse;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseLockRequest {
    pub key: Vec<u8>,
    pub commit_wts: u64,
}

/// One decoded message piece.
#[derive(Clone, Debug)]
pub struct Piece {
    pub kind: PieceKind,
    pub table_id: usize,
    pub partition_id: usize,
    payload: Vec<u8>,
}

impl Piece {
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P, Error> {
        bincode::deserialize(&self.payload).map_err(Error::from)
    }
}

const PIECE_HEADER: usize = 2 + 2 + 2 + 4;

/// An addressed sequence of pieces, owning its byte buffer. Workers keep
/// one open frame per peer, append pieces as the protocol emits them, and
/// hand the frame to the out-queue on flush.
#[derive(Clone, Debug)]
pub struct Frame {
    source: usize,
    dest: usize,
    worker: usize,
    count: usize,
    buf: Vec<u8>,
}

impl Frame {
    pub fn new(source: usize, dest: usize, worker: usize) -> Self {
        Frame {
            source,
            dest,
            worker,
            count: 0,
            buf: Vec::new(),
        }
    }

    pub fn source(&self) -> usize {
        self.source
    }

    pub fn dest(&self) -> usize {
        self.dest
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append one piece; returns the number of bytes added, which the
    /// protocol accumulates into the transaction's network footprint.
    pub fn append<P: Serialize>(
        &mut self,
        kind: PieceKind,
        table_id: usize,
        partition_id: usize,
        payload: &P,
    ) -> usize {
        let bytes = bincode::serialize(payload).expect("piece payloads always serialize");
        self.buf
            .write_u16::<LittleEndian>(kind as u16)
            .expect("vec write");
        self.buf
            .write_u16::<LittleEndian>(table_id as u16)
            .expect("vec write");
        self.buf
            .write_u16::<LittleEndian>(partition_id as u16)
            .expect("vec write");
        self.buf
            .write_u32::<LittleEndian>(bytes.len() as u32)
            .expect("vec write");
        self.buf.extend_from_slice(&bytes);
        self.count += 1;
        PIECE_HEADER + bytes.len()
    }

    /// Decode the pieces in order. The buffer came from this process or
    /// from the (trusted, reliable) socket layer, so a malformed buffer is
    /// a fault reported as [Error], not a recoverable condition.
    pub fn pieces(&self) -> Result<Vec<Piece>, Error> {
        let mut cur = Cursor::new(&self.buf[..]);
        let mut out = Vec::with_capacity(self.count);
        for _ in 0..self.count {
            let kind = PieceKind::try_from(cur.read_u16::<LittleEndian>()?)?;
            let table_id = cur.read_u16::<LittleEndian>()? as usize;
            let partition_id = cur.read_u16::<LittleEndian>()? as usize;
            let len = cur.read_u32::<LittleEndian>()? as usize;
            let start = cur.position() as usize;
            let end = start + len;
            if end > self.buf.len() {
                return Err(Error::TruncatedFrame);
            }
            out.push(Piece {
                kind,
                table_id,
                partition_id,
                payload: self.buf[start..end].to_vec(),
            });
            cur.set_position(end as u64);
        }
        Ok(out)
    }

    /// Serialize the whole frame for the socket layer:
    /// `(source:u16, dest:u16, worker:u16, count:u16)` then the piece
    /// buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.buf.len());
        out.write_u16::<LittleEndian>(self.source as u16)
            .expect("vec write");
        out.write_u16::<LittleEndian>(self.dest as u16)
            .expect("vec write");
        out.write_u16::<LittleEndian>(self.worker as u16)
            .expect("vec write");
        out.write_u16::<LittleEndian>(self.count as u16)
            .expect("vec write");
        out.extend_from_slice(&self.buf);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut cur = Cursor::new(bytes);
        let source = cur.read_u16::<LittleEndian>()? as usize;
        let dest = cur.read_u16::<LittleEndian>()? as usize;
        let worker = cur.read_u16::<LittleEndian>()? as usize;
        let count = cur.read_u16::<LittleEndian>()? as usize;
        Ok(Frame {
            source,
            dest,
            worker,
            count,
            buf: bytes[8..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_kind_tags_are_dense() {
        for tag in 0..PIECE_KINDS as u16 {
            let kind = PieceKind::try_from(tag).expect("dense");
            assert_eq!(kind as u16, tag);
        }
        assert!(PieceKind::try_from(PIECE_KINDS as u16).is_err());
    }

    #[test]
    fn append_then_decode_is_identity() {
        let mut f = Frame::new(0, 1, 3);
        let lock = LockRequest {
            key: vec![1, 2, 3],
            write_offset: 7,
        };
        let val = ReadValidationRequest {
            key: vec![4],
            read_offset: 2,
            snapshot: 0xabcd,
            commit_ts: 99,
        };
        let repl = ReplicationRequest {
            key: vec![5, 6],
            value: vec![7; 16],
            commit_wts: 12,
        };
        f.append(PieceKind::LockRequest, 0, 4, &lock);
        f.append(PieceKind::ReadValidationRequest, 1, 5, &val);
        f.append(PieceKind::ReplicationRequest, 2, 6, &repl);
        assert_eq!(f.count(), 3);

        let pieces = f.pieces().expect("decodes");
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].kind, PieceKind::LockRequest);
        assert_eq!(pieces[0].table_id, 0);
        assert_eq!(pieces[0].partition_id, 4);
        assert_eq!(pieces[0].decode::<LockRequest>().expect("payload"), lock);
        assert_eq!(
            pieces[1].decode::<ReadValidationRequest>().expect("payload"),
            val
        );
        assert_eq!(
            pieces[2].decode::<ReplicationRequest>().expect("payload"),
            repl
        );
    }

    #[test]
    fn frame_bytes_round_trip() {
        let mut f = Frame::new(2, 0, 1);
        f.append(
            PieceKind::SearchRequest,
            0,
            3,
            &SearchRequest {
                key: vec![9],
                key_offset: 0,
            },
        );
        let copy = Frame::from_bytes(&f.to_bytes()).expect("decodes");
        assert_eq!(copy.source(), 2);
        assert_eq!(copy.dest(), 0);
        assert_eq!(copy.worker(), 1);
        assert_eq!(copy.count(), 1);
        let pieces = copy.pieces().expect("decodes");
        assert_eq!(
            pieces[0].decode::<SearchRequest>().expect("payload").key,
            vec![9]
        );
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut f = Frame::new(0, 1, 0);
        f.append(
            PieceKind::AbortRequest,
            0,
            0,
            &AbortRequest { key: vec![1, 2] },
        );
        let mut bytes = f.to_bytes();
        bytes.truncate(bytes.len() - 1);
        let broken = Frame::from_bytes(&bytes).expect("header decodes");
        assert!(broken.pieces().is_err());
    }
}
