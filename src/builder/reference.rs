//! Hand-written wire encoding, independent of the `bitcoin` crate
//!
//! Layout (BIP144 when any input carries a witness):
//! version | [marker 0x00, flag 0x01] | inputs | outputs | [witnesses] | locktime

use sha2::{Digest, Sha256};

use crate::error::{Result, WalletError};
use crate::types::{OutPoint, Transaction, TxInput, TxOutput};

use super::{write_outpoint, BuilderBackend, TransactionBuilder};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceBuilder;

impl TransactionBuilder for ReferenceBuilder {
    fn backend(&self) -> BuilderBackend {
        BuilderBackend::Reference
    }

    fn encode(&self, tx: &Transaction) -> Result<Vec<u8>> {
        // A transaction without inputs is always written in witness form,
        // otherwise its empty input count would read as the marker.
        serialize(tx, tx.has_witness() || tx.inputs.is_empty())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Transaction> {
        let mut reader = Reader::new(bytes);
        let tx = read_transaction(&mut reader)?;
        if !reader.is_empty() {
            return Err(malformed(format!("{} trailing bytes", reader.remaining())));
        }
        Ok(tx)
    }

    fn txid(&self, tx: &Transaction) -> Result<String> {
        let mut hash = double_sha256(&serialize(tx, false)?);
        hash.reverse();
        Ok(hex::encode(hash))
    }
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

pub fn write_varint(buf: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&n.to_le_bytes());
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn serialize(tx: &Transaction, with_witness: bool) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&tx.version.to_le_bytes());
    if with_witness {
        buf.extend_from_slice(&[0x00, 0x01]);
    }

    write_varint(&mut buf, tx.inputs.len() as u64);
    for input in &tx.inputs {
        write_outpoint(&mut buf, &input.previous_output)?;
        write_bytes(&mut buf, &input.script_sig);
        buf.extend_from_slice(&input.sequence.to_le_bytes());
    }

    write_varint(&mut buf, tx.outputs.len() as u64);
    for output in &tx.outputs {
        buf.extend_from_slice(&output.value.to_le_bytes());
        write_bytes(&mut buf, &output.script_pubkey);
    }

    if with_witness {
        for input in &tx.inputs {
            write_varint(&mut buf, input.witness.len() as u64);
            for item in &input.witness {
                write_bytes(&mut buf, item);
            }
        }
    }

    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
    Ok(buf)
}

fn malformed(reason: impl Into<String>) -> WalletError {
    WalletError::MalformedTransaction(reason.into())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(malformed(format!("unexpected end of data at byte {}", self.pos)));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// CompactSize; non-minimal encodings are rejected
    fn varint(&mut self) -> Result<u64> {
        let (value, min) = match self.u8()? {
            0xff => (self.u64()?, 0x1_0000_0000),
            0xfe => (self.u32()? as u64, 0x1_0000),
            0xfd => (u16::from_le_bytes(self.array()?) as u64, 0xfd),
            n => return Ok(n as u64),
        };
        if value < min {
            return Err(malformed("non-minimal varint"));
        }
        Ok(value)
    }

    /// A count of items that each take at least `min_item_size` bytes
    fn count(&mut self, min_item_size: usize) -> Result<usize> {
        let n = self.varint()?;
        if n > (self.remaining() / min_item_size.max(1)) as u64 {
            return Err(malformed(format!("count {} exceeds remaining data", n)));
        }
        Ok(n as usize)
    }

    fn var_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.count(1)?;
        Ok(self.take(len)?.to_vec())
    }
}

fn read_transaction(r: &mut Reader<'_>) -> Result<Transaction> {
    let version = i32::from_le_bytes(r.array()?);

    let segwit = r.peek() == Some(0x00);
    if segwit {
        r.u8()?;
        let flag = r.u8()?;
        if flag != 0x01 {
            return Err(malformed(format!("unsupported segwit flag {}", flag)));
        }
    }

    // outpoint(36) + script len(1) + sequence(4)
    let input_count = r.count(41)?;
    let mut inputs = Vec::with_capacity(input_count);
    for _ in 0..input_count {
        let txid = r.array::<32>()?;
        let vout = r.u32()?;
        let script_sig = r.var_bytes()?;
        let sequence = r.u32()?;
        inputs.push(TxInput {
            previous_output: OutPoint::from_txid_bytes(txid, vout),
            script_sig,
            sequence,
            witness: Vec::new(),
        });
    }

    // value(8) + script len(1)
    let output_count = r.count(9)?;
    let mut outputs = Vec::with_capacity(output_count);
    for _ in 0..output_count {
        let value = r.u64()?;
        let script_pubkey = r.var_bytes()?;
        outputs.push(TxOutput::new(script_pubkey, value));
    }

    if segwit {
        for input in inputs.iter_mut() {
            let items = r.count(1)?;
            for _ in 0..items {
                input.witness.push(r.var_bytes()?);
            }
        }
        if inputs.iter().all(|i| i.witness.is_empty()) {
            return Err(malformed("witness flag set but no witnesses present"));
        }
    }

    let lock_time = r.u32()?;

    Ok(Transaction { version, lock_time, inputs, outputs })
}
