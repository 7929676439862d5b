use alloy_primitives::{
    Address,
    B256,
    Bloom,
    Bytes,
    U256,
    keccak256,
};
use alloy_rlp::{
    BufMut,
    Decodable,
    Encodable,
    Header as RlpHeader,
};

/// Block header. Immutable once hashed: the hash is `keccak256(rlp(header))`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub parent_hash: B256,
    pub rewardbase: Address,
    pub state_root: B256,
    pub tx_root: B256,
    pub receipt_root: B256,
    pub bloom: Bloom,
    pub block_score: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub time: u64,
    pub extra: Bytes,
    /// Present from the Magma fork on.
    pub base_fee: Option<U256>,
}

impl Header {
    pub fn hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// Rough in-memory footprint, used for cache accounting.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.extra.len()
    }

    fn fields_len(&self) -> usize {
        let mut len = self.parent_hash.length() +
            self.rewardbase.length() +
            self.state_root.length() +
            self.tx_root.length() +
            self.receipt_root.length() +
            self.bloom.length() +
            self.block_score.length() +
            self.number.length() +
            self.gas_limit.length() +
            self.gas_used.length() +
            self.time.length() +
            self.extra.length();
        if let Some(base_fee) = &self.base_fee {
            len += base_fee.length();
        }
        len
    }
}

impl Encodable for Header {
    fn encode(&self, out: &mut dyn BufMut) {
        RlpHeader {
            list: true,
            payload_length: self.fields_len(),
        }
        .encode(out);
        self.parent_hash.encode(out);
        self.rewardbase.encode(out);
        self.state_root.encode(out);
        self.tx_root.encode(out);
        self.receipt_root.encode(out);
        self.bloom.encode(out);
        self.block_score.encode(out);
        self.number.encode(out);
        self.gas_limit.encode(out);
        self.gas_used.encode(out);
        self.time.encode(out);
        self.extra.encode(out);
        if let Some(base_fee) = &self.base_fee {
            base_fee.encode(out);
        }
    }

    fn length(&self) -> usize {
        let payload_length = self.fields_len();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Header {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let rlp_head = RlpHeader::decode(buf)?;
        if !rlp_head.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let started_len = buf.len();
        let mut header = Self {
            parent_hash: Decodable::decode(buf)?,
            rewardbase: Decodable::decode(buf)?,
            state_root: Decodable::decode(buf)?,
            tx_root: Decodable::decode(buf)?,
            receipt_root: Decodable::decode(buf)?,
            bloom: Decodable::decode(buf)?,
            block_score: Decodable::decode(buf)?,
            number: Decodable::decode(buf)?,
            gas_limit: Decodable::decode(buf)?,
            gas_used: Decodable::decode(buf)?,
            time: Decodable::decode(buf)?,
            extra: Decodable::decode(buf)?,
            base_fee: None,
        };
        if started_len - buf.len() < rlp_head.payload_length {
            header.base_fee = Some(Decodable::decode(buf)?);
        }
        let consumed = started_len - buf.len();
        if consumed != rlp_head.payload_length {
            return Err(alloy_rlp::Error::ListLengthMismatch {
                expected: rlp_head.payload_length,
                got: consumed,
            });
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header {
            parent_hash: B256::repeat_byte(1),
            rewardbase: Address::repeat_byte(2),
            state_root: B256::repeat_byte(3),
            number: 42,
            gas_limit: 30_000_000,
            gas_used: 21_000,
            time: 1_700_000_000,
            block_score: U256::from(1),
            extra: Bytes::from_static(b"extra"),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_with_and_without_base_fee() {
        let mut header = sample();
        let encoded = alloy_rlp::encode(&header);
        let decoded = Header::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.base_fee.is_none());

        header.base_fee = Some(U256::from(25));
        let encoded = alloy_rlp::encode(&header);
        let decoded = Header::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded.base_fee, Some(U256::from(25)));
    }

    #[test]
    fn hash_covers_every_field() {
        let header = sample();
        let mut other = header.clone();
        other.time += 1;
        assert_ne!(header.hash(), other.hash(), "time must affect the header hash");
        other = header.clone();
        other.base_fee = Some(U256::ZERO);
        assert_ne!(header.hash(), other.hash(), "base fee presence must affect the header hash");
    }
}
