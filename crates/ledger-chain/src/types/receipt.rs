use alloy_primitives::{
    Address,
    B256,
    Bloom,
    BloomInput,
    Bytes,
};
use alloy_rlp::{
    BufMut,
    Decodable,
    Encodable,
    Header as RlpHeader,
};

/// Execution status recorded in a receipt.
///
/// Values are consecutive from `Failed` to `ErrInvalidCodeFormat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReceiptStatus {
    Failed = 0x00,
    Successful = 0x01,
    ErrDefault = 0x02,
    ErrDepth = 0x03,
    ErrContractAddressCollision = 0x04,
    ErrCodeStoreOutOfGas = 0x05,
    ErrMaxCodeSizeExceed = 0x06,
    ErrOutOfGas = 0x07,
    ErrWriteProtection = 0x08,
    ErrExecutionReverted = 0x09,
    ErrOpcodeComputationCostLimitReached = 0x0a,
    ErrAddressAlreadyExists = 0x0b,
    ErrNotAProgramAccount = 0x0c,
    ErrNotHumanReadableAddress = 0x0d,
    ErrFeeRatioOutOfRange = 0x0e,
    ErrAccountKeyFailNotUpdatable = 0x0f,
    ErrDifferentAccountKeyType = 0x10,
    ErrAccountKeyNilUninitializable = 0x11,
    ErrNotOnCurve = 0x12,
    ErrZeroKeyWeight = 0x13,
    ErrUnserializableKey = 0x14,
    ErrDuplicatedKey = 0x15,
    ErrWeightedSumOverflow = 0x16,
    ErrUnsatisfiableThreshold = 0x17,
    ErrZeroLength = 0x18,
    ErrLengthTooLong = 0x19,
    ErrNestedRoleBasedKey = 0x1a,
    ErrLegacyTransactionMustBeWithLegacyKey = 0x1b,
    ErrDeprecated = 0x1c,
    ErrNotSupported = 0x1d,
    ErrInvalidCodeFormat = 0x1e,
}

impl ReceiptStatus {
    pub const LAST: Self = Self::ErrInvalidCodeFormat;

    pub fn from_u8(value: u8) -> Option<Self> {
        use ReceiptStatus::*;
        const ALL: [ReceiptStatus; 31] = [
            Failed,
            Successful,
            ErrDefault,
            ErrDepth,
            ErrContractAddressCollision,
            ErrCodeStoreOutOfGas,
            ErrMaxCodeSizeExceed,
            ErrOutOfGas,
            ErrWriteProtection,
            ErrExecutionReverted,
            ErrOpcodeComputationCostLimitReached,
            ErrAddressAlreadyExists,
            ErrNotAProgramAccount,
            ErrNotHumanReadableAddress,
            ErrFeeRatioOutOfRange,
            ErrAccountKeyFailNotUpdatable,
            ErrDifferentAccountKeyType,
            ErrAccountKeyNilUninitializable,
            ErrNotOnCurve,
            ErrZeroKeyWeight,
            ErrUnserializableKey,
            ErrDuplicatedKey,
            ErrWeightedSumOverflow,
            ErrUnsatisfiableThreshold,
            ErrZeroLength,
            ErrLengthTooLong,
            ErrNestedRoleBasedKey,
            ErrLegacyTransactionMustBeWithLegacyKey,
            ErrDeprecated,
            ErrNotSupported,
            ErrInvalidCodeFormat,
        ];
        ALL.get(usize::from(value)).copied()
    }

    pub fn is_successful(&self) -> bool {
        *self == Self::Successful
    }
}

/// Event emitted during execution.
///
/// Only `address`, `topics` and `data` are consensus fields; the rest are
/// filled in when the receipt is stored or read back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: B256,
    pub tx_index: u32,
    pub block_hash: B256,
    pub index: u32,
    /// Set when the log was reverted by a chain reorganisation.
    pub removed: bool,
}

impl Log {
    pub fn new(address: Address, topics: Vec<B256>, data: Bytes) -> Self {
        Self {
            address,
            topics,
            data,
            ..Default::default()
        }
    }

    fn fields_len(&self) -> usize {
        self.address.length() + self.topics.length() + self.data.length()
    }
}

impl Encodable for Log {
    fn encode(&self, out: &mut dyn BufMut) {
        RlpHeader {
            list: true,
            payload_length: self.fields_len(),
        }
        .encode(out);
        self.address.encode(out);
        self.topics.encode(out);
        self.data.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.fields_len();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Log {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let rlp_head = RlpHeader::decode(buf)?;
        if !rlp_head.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let started_len = buf.len();
        let log = Self::new(
            Decodable::decode(buf)?,
            Decodable::decode(buf)?,
            Decodable::decode(buf)?,
        );
        if started_len - buf.len() != rlp_head.payload_length {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }
        Ok(log)
    }
}

/// Result of executing a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub status: ReceiptStatus,
    pub gas_used: u64,
    pub logs: Vec<Log>,
    pub bloom: Bloom,
    pub tx_hash: B256,
    pub contract_address: Option<Address>,
}

impl Receipt {
    pub fn new(status: ReceiptStatus, tx_hash: B256, gas_used: u64) -> Self {
        Self {
            status,
            gas_used,
            logs: Vec::new(),
            bloom: Bloom::ZERO,
            tx_hash,
            contract_address: None,
        }
    }

    pub fn failed(&self) -> bool {
        !self.status.is_successful()
    }

    fn consensus_fields_len(&self) -> usize {
        (self.status as u8).length() + self.gas_used.length() + self.bloom.length() + self.logs.length()
    }

    fn contract_address_bytes(&self) -> Bytes {
        self.contract_address
            .map(|address| Bytes::copy_from_slice(address.as_slice()))
            .unwrap_or_default()
    }

    fn storage_fields_len(&self) -> usize {
        self.consensus_fields_len() + self.tx_hash.length() + self.contract_address_bytes().length()
    }

    /// Storage form: consensus fields plus `tx_hash` and `contract_address`.
    pub fn encode_for_storage(&self, out: &mut dyn BufMut) {
        RlpHeader {
            list: true,
            payload_length: self.storage_fields_len(),
        }
        .encode(out);
        (self.status as u8).encode(out);
        self.gas_used.encode(out);
        self.bloom.encode(out);
        self.logs.encode(out);
        self.tx_hash.encode(out);
        self.contract_address_bytes().encode(out);
    }

    pub fn decode_from_storage(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let rlp_head = RlpHeader::decode(buf)?;
        if !rlp_head.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let started_len = buf.len();
        let status = ReceiptStatus::from_u8(u8::decode(buf)?)
            .ok_or(alloy_rlp::Error::Custom("unknown receipt status"))?;
        let gas_used = u64::decode(buf)?;
        let bloom = Bloom::decode(buf)?;
        let logs = Vec::<Log>::decode(buf)?;
        let tx_hash = B256::decode(buf)?;
        let contract_address = Bytes::decode(buf)?;
        let contract_address = match contract_address.len() {
            0 => None,
            20 => Some(Address::from_slice(&contract_address)),
            _ => return Err(alloy_rlp::Error::UnexpectedLength),
        };
        if started_len - buf.len() != rlp_head.payload_length {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }
        Ok(Self {
            status,
            gas_used,
            logs,
            bloom,
            tx_hash,
            contract_address,
        })
    }
}

/// Consensus form, used for the receipt root.
impl Encodable for Receipt {
    fn encode(&self, out: &mut dyn BufMut) {
        RlpHeader {
            list: true,
            payload_length: self.consensus_fields_len(),
        }
        .encode(out);
        (self.status as u8).encode(out);
        self.gas_used.encode(out);
        self.bloom.encode(out);
        self.logs.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.consensus_fields_len();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

pub fn encode_receipts_for_storage(receipts: &[Receipt]) -> Vec<u8> {
    let mut payload = Vec::new();
    for receipt in receipts {
        receipt.encode_for_storage(&mut payload);
    }
    let mut out = Vec::with_capacity(payload.len() + 8);
    RlpHeader {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

pub fn decode_receipts_from_storage(mut buf: &[u8]) -> alloy_rlp::Result<Vec<Receipt>> {
    let rlp_head = RlpHeader::decode(&mut buf)?;
    if !rlp_head.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    let (mut items, _) = buf.split_at(rlp_head.payload_length.min(buf.len()));
    let mut receipts = Vec::new();
    while !items.is_empty() {
        receipts.push(Receipt::decode_from_storage(&mut items)?);
    }
    Ok(receipts)
}

/// Bloom over the logs of a single receipt.
pub fn logs_bloom<'a>(logs: impl IntoIterator<Item = &'a Log>) -> Bloom {
    let mut bloom = Bloom::ZERO;
    for log in logs {
        bloom.accrue(BloomInput::Raw(log.address.as_slice()));
        for topic in &log.topics {
            bloom.accrue(BloomInput::Raw(topic.as_slice()));
        }
    }
    bloom
}

/// Union of the blooms of all receipts.
pub fn create_bloom(receipts: &[Receipt]) -> Bloom {
    let mut bloom = Bloom::ZERO;
    for receipt in receipts {
        bloom.accrue_bloom(&receipt.bloom);
    }
    bloom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt_with_log() -> Receipt {
        let log = Log::new(
            Address::repeat_byte(1),
            vec![B256::repeat_byte(2)],
            Bytes::from_static(b"data"),
        );
        let mut receipt = Receipt::new(ReceiptStatus::Successful, B256::repeat_byte(3), 21_000);
        receipt.bloom = logs_bloom([&log]);
        receipt.logs = vec![log];
        receipt.contract_address = Some(Address::repeat_byte(4));
        receipt
    }

    #[test]
    fn storage_encoding_keeps_tx_hash_and_contract() {
        let receipts = vec![
            receipt_with_log(),
            Receipt::new(ReceiptStatus::ErrExecutionReverted, B256::ZERO, 5),
        ];
        let encoded = encode_receipts_for_storage(&receipts);
        let decoded = decode_receipts_from_storage(&encoded).unwrap();
        assert_eq!(decoded, receipts);
    }

    #[test]
    fn bloom_contains_log_address_and_topics() {
        let receipt = receipt_with_log();
        let bloom = create_bloom(std::slice::from_ref(&receipt));
        assert!(bloom.contains_input(BloomInput::Raw(Address::repeat_byte(1).as_slice())));
        assert!(bloom.contains_input(BloomInput::Raw(B256::repeat_byte(2).as_slice())));
        assert!(!bloom.contains_input(BloomInput::Raw(B256::repeat_byte(9).as_slice())));
    }

    #[test]
    fn status_table_is_consecutive() {
        for value in 0..=ReceiptStatus::LAST as u8 {
            let status = ReceiptStatus::from_u8(value).unwrap();
            assert_eq!(status as u8, value);
        }
        assert!(ReceiptStatus::from_u8(ReceiptStatus::LAST as u8 + 1).is_none());
    }
}
