use crate::types::{
    Header,
    Transaction,
};
use alloy_primitives::{
    B256,
    U256,
};
use alloy_rlp::{
    BufMut,
    Decodable,
    Encodable,
    Header as RlpHeader,
};
use std::sync::Arc;

/// Ordered transactions of a block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Body {
    pub transactions: Vec<Transaction>,
}

impl Encodable for Body {
    fn encode(&self, out: &mut dyn BufMut) {
        RlpHeader {
            list: true,
            payload_length: self.transactions.length(),
        }
        .encode(out);
        self.transactions.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.transactions.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Body {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let rlp_head = RlpHeader::decode(buf)?;
        if !rlp_head.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let started_len = buf.len();
        let transactions = Decodable::decode(buf)?;
        if started_len - buf.len() != rlp_head.payload_length {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }
        Ok(Self { transactions })
    }
}

/// A sealed block: header plus body, with the header hash computed once.
#[derive(Debug, Clone)]
pub struct Block {
    header: Header,
    body: Body,
    hash: B256,
}

/// Blocks are shared between the import pipeline, caches and event feeds.
pub type BlockRef = Arc<Block>;

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Block {}

impl Block {
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        let hash = header.hash();
        Self {
            header,
            body: Body { transactions },
            hash,
        }
    }

    pub fn from_parts(header: Header, body: Body) -> Self {
        Self::new(header, body.transactions)
    }

    pub fn hash(&self) -> B256 {
        self.hash
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.body.transactions
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> B256 {
        self.header.parent_hash
    }

    pub fn state_root(&self) -> B256 {
        self.header.state_root
    }

    pub fn time(&self) -> u64 {
        self.header.time
    }

    pub fn block_score(&self) -> U256 {
        self.header.block_score
    }

    pub fn gas_used(&self) -> u64 {
        self.header.gas_used
    }

    /// Returns a copy of this block with the given body.
    pub fn with_body(&self, transactions: Vec<Transaction>) -> Self {
        Self {
            header: self.header.clone(),
            body: Body { transactions },
            hash: self.hash,
        }
    }

    fn fields_len(&self) -> usize {
        self.header.length() + self.body.transactions.length()
    }
}

/// Network/export form: `rlp([header, [txs...]])`.
impl Encodable for Block {
    fn encode(&self, out: &mut dyn BufMut) {
        RlpHeader {
            list: true,
            payload_length: self.fields_len(),
        }
        .encode(out);
        self.header.encode(out);
        self.body.transactions.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.fields_len();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Block {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let rlp_head = RlpHeader::decode(buf)?;
        if !rlp_head.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let started_len = buf.len();
        let header = Header::decode(buf)?;
        let transactions = Vec::<Transaction>::decode(buf)?;
        if started_len - buf.len() != rlp_head.payload_length {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }
        Ok(Self::new(header, transactions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::TestKey,
        types::{
            LegacyTx,
            TxData,
        },
    };
    use alloy_primitives::{
        Address,
        Bytes,
        TxKind,
    };

    #[test]
    fn block_round_trips_with_mixed_transactions() {
        let key = TestKey::from_seed(9);
        let transactions = (0..3)
            .map(|nonce| {
                key.sign(TxData::Legacy(LegacyTx {
                    nonce,
                    gas_price: U256::from(1),
                    gas: 21_000,
                    to: TxKind::Call(Address::repeat_byte(5)),
                    value: U256::from(nonce),
                    input: Bytes::new(),
                }))
            })
            .collect::<Vec<_>>();
        let header = Header {
            number: 7,
            ..Default::default()
        };
        let block = Block::new(header, transactions);
        let encoded = alloy_rlp::encode(&block);
        let decoded = Block::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded.hash(), block.hash());
        assert_eq!(decoded.transactions(), block.transactions());

        let body = alloy_rlp::encode(block.body());
        assert_eq!(Body::decode(&mut body.as_slice()).unwrap(), *block.body());
    }
}
