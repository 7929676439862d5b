//! Transaction variants, their envelope encoding and signature handling.
//!
//! Every variant is a tagged member of [`TxData`]. Operations that differ per
//! variant (`intrinsic_gas`, `fee_payer`, type-specific validation) are
//! resolved with a single `match` here instead of at the call sites.

use crate::{
    params,
    types::macros::impl_rlp_fields,
};
use alloy_primitives::{
    Address,
    B256,
    Bytes,
    Signature,
    TxKind,
    U256,
    keccak256,
};
use alloy_rlp::{
    BufMut,
    Decodable,
    Encodable,
    Header as RlpHeader,
    RlpDecodable,
    RlpEncodable,
};
use std::sync::OnceLock;

/// Errors intrinsic to a transaction, independent of any state.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("Invalid transaction v, r, s values")]
    InvalidSig,
    #[error("Invalid chain id for signer")]
    InvalidChainId,
    #[error("Invalid sender: recovered {recovered}, declared {declared}")]
    InvalidSender {
        recovered: Address,
        declared: Address,
    },
    #[error("Invalid fee payer: recovered {recovered}, declared {declared}")]
    InvalidFeePayer {
        recovered: Address,
        declared: Address,
    },
    #[error("Fee ratio is out of range [1, 99]")]
    FeeRatioOutOfRange,
    #[error("Empty anchored data")]
    EmptyAnchoredData,
    #[error("Intrinsic gas overflow")]
    IntrinsicGasOverflow,
    #[error("Transaction type not supported")]
    TxTypeNotSupported,
}

/// Discriminant of a transaction variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxType {
    Legacy,
    FeeDelegatedValueTransfer,
    FeeDelegatedValueTransferWithRatio,
    Cancel,
    ChainDataAnchoring,
    EthereumAccessList,
    EthereumDynamicFee,
}

/// Prefix byte of Ethereum typed transactions carried in the envelope.
pub const ETH_TX_TYPE_ENVELOPE: u8 = 0x78;

impl TxType {
    /// Byte prefix of the encoded envelope. Legacy transactions have none.
    pub fn prefix(&self) -> &'static [u8] {
        match self {
            Self::Legacy => &[],
            Self::FeeDelegatedValueTransfer => &[0x09],
            Self::FeeDelegatedValueTransferWithRatio => &[0x0a],
            Self::Cancel => &[0x38],
            Self::ChainDataAnchoring => &[0x48],
            Self::EthereumAccessList => &[ETH_TX_TYPE_ENVELOPE, 0x01],
            Self::EthereumDynamicFee => &[ETH_TX_TYPE_ENVELOPE, 0x02],
        }
    }

    pub fn code(&self) -> u64 {
        match self {
            Self::Legacy => 0,
            Self::FeeDelegatedValueTransfer => 0x09,
            Self::FeeDelegatedValueTransferWithRatio => 0x0a,
            Self::Cancel => 0x38,
            Self::ChainDataAnchoring => 0x48,
            Self::EthereumAccessList => 0x7801,
            Self::EthereumDynamicFee => 0x7802,
        }
    }

    pub fn is_fee_delegated(&self) -> bool {
        matches!(
            self,
            Self::FeeDelegatedValueTransfer | Self::FeeDelegatedValueTransferWithRatio
        )
    }

    pub fn is_ethereum_typed(&self) -> bool {
        matches!(self, Self::EthereumAccessList | Self::EthereumDynamicFee)
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, Self::Cancel)
    }
}

/// Percentage of the fee paid by the fee payer, valid in `1..=99`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeeRatio(pub u8);

impl FeeRatio {
    pub fn is_valid(&self) -> bool {
        (1..=99).contains(&self.0)
    }

    /// Splits `fee` into `(fee_payer_part, sender_part)`.
    pub fn split(&self, fee: U256) -> (U256, U256) {
        let fee_payer = fee * U256::from(self.0) / U256::from(100u64);
        (fee_payer, fee - fee_payer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, RlpEncodable, RlpDecodable)]
pub struct AccessTuple {
    pub address: Address,
    pub storage_keys: Vec<B256>,
}

pub type AccessList = Vec<AccessTuple>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    pub to: TxKind,
    pub value: U256,
    pub input: Bytes,
}
impl_rlp_fields!(LegacyTx {
    nonce,
    gas_price,
    gas,
    to,
    value,
    input
});

/// Value transfer whose fee is paid by a second signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeDelegatedTx {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    pub to: Address,
    pub value: U256,
    pub from: Address,
}
impl_rlp_fields!(FeeDelegatedTx {
    nonce,
    gas_price,
    gas,
    to,
    value,
    from
});

/// Invalidates a pending transaction of the same nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelTx {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    pub from: Address,
}
impl_rlp_fields!(CancelTx {
    nonce,
    gas_price,
    gas,
    from
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchoringTx {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    pub from: Address,
    pub anchored_data: Bytes,
}
impl_rlp_fields!(AnchoringTx {
    nonce,
    gas_price,
    gas,
    from,
    anchored_data
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessListTx {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: u64,
    pub to: TxKind,
    pub value: U256,
    pub input: Bytes,
    pub access_list: AccessList,
}
impl_rlp_fields!(AccessListTx {
    chain_id,
    nonce,
    gas_price,
    gas,
    to,
    value,
    input,
    access_list
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicFeeTx {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_tip_cap: U256,
    pub gas_fee_cap: U256,
    pub gas: u64,
    pub to: TxKind,
    pub value: U256,
    pub input: Bytes,
    pub access_list: AccessList,
}
impl_rlp_fields!(DynamicFeeTx {
    chain_id,
    nonce,
    gas_tip_cap,
    gas_fee_cap,
    gas,
    to,
    value,
    input,
    access_list
});

/// The unsigned body of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxData {
    Legacy(LegacyTx),
    FeeDelegated(FeeDelegatedTx),
    FeeDelegatedWithRatio(FeeDelegatedTx, FeeRatio),
    Cancel(CancelTx),
    ChainDataAnchoring(AnchoringTx),
    AccessList(AccessListTx),
    DynamicFee(DynamicFeeTx),
}

impl TxData {
    pub fn tx_type(&self) -> TxType {
        match self {
            Self::Legacy(_) => TxType::Legacy,
            Self::FeeDelegated(_) => TxType::FeeDelegatedValueTransfer,
            Self::FeeDelegatedWithRatio(..) => TxType::FeeDelegatedValueTransferWithRatio,
            Self::Cancel(_) => TxType::Cancel,
            Self::ChainDataAnchoring(_) => TxType::ChainDataAnchoring,
            Self::AccessList(_) => TxType::EthereumAccessList,
            Self::DynamicFee(_) => TxType::EthereumDynamicFee,
        }
    }

    pub fn nonce(&self) -> u64 {
        match self {
            Self::Legacy(tx) => tx.nonce,
            Self::FeeDelegated(tx) | Self::FeeDelegatedWithRatio(tx, _) => tx.nonce,
            Self::Cancel(tx) => tx.nonce,
            Self::ChainDataAnchoring(tx) => tx.nonce,
            Self::AccessList(tx) => tx.nonce,
            Self::DynamicFee(tx) => tx.nonce,
        }
    }

    pub fn gas(&self) -> u64 {
        match self {
            Self::Legacy(tx) => tx.gas,
            Self::FeeDelegated(tx) | Self::FeeDelegatedWithRatio(tx, _) => tx.gas,
            Self::Cancel(tx) => tx.gas,
            Self::ChainDataAnchoring(tx) => tx.gas,
            Self::AccessList(tx) => tx.gas,
            Self::DynamicFee(tx) => tx.gas,
        }
    }

    /// Gas price for non-dynamic variants; the fee cap for dynamic-fee ones.
    pub fn gas_price(&self) -> U256 {
        match self {
            Self::Legacy(tx) => tx.gas_price,
            Self::FeeDelegated(tx) | Self::FeeDelegatedWithRatio(tx, _) => tx.gas_price,
            Self::Cancel(tx) => tx.gas_price,
            Self::ChainDataAnchoring(tx) => tx.gas_price,
            Self::AccessList(tx) => tx.gas_price,
            Self::DynamicFee(tx) => tx.gas_fee_cap,
        }
    }

    pub fn gas_fee_cap(&self) -> U256 {
        match self {
            Self::DynamicFee(tx) => tx.gas_fee_cap,
            other => other.gas_price(),
        }
    }

    pub fn gas_tip_cap(&self) -> U256 {
        match self {
            Self::DynamicFee(tx) => tx.gas_tip_cap,
            other => other.gas_price(),
        }
    }

    pub fn to(&self) -> TxKind {
        match self {
            Self::Legacy(tx) => tx.to,
            Self::FeeDelegated(tx) | Self::FeeDelegatedWithRatio(tx, _) => TxKind::Call(tx.to),
            Self::Cancel(tx) => TxKind::Call(tx.from),
            Self::ChainDataAnchoring(tx) => TxKind::Call(tx.from),
            Self::AccessList(tx) => tx.to,
            Self::DynamicFee(tx) => tx.to,
        }
    }

    pub fn value(&self) -> U256 {
        match self {
            Self::Legacy(tx) => tx.value,
            Self::FeeDelegated(tx) | Self::FeeDelegatedWithRatio(tx, _) => tx.value,
            Self::Cancel(_) | Self::ChainDataAnchoring(_) => U256::ZERO,
            Self::AccessList(tx) => tx.value,
            Self::DynamicFee(tx) => tx.value,
        }
    }

    pub fn input(&self) -> &Bytes {
        static EMPTY: Bytes = Bytes::new();
        match self {
            Self::Legacy(tx) => &tx.input,
            Self::AccessList(tx) => &tx.input,
            Self::DynamicFee(tx) => &tx.input,
            Self::ChainDataAnchoring(tx) => &tx.anchored_data,
            Self::FeeDelegated(_) | Self::FeeDelegatedWithRatio(..) | Self::Cancel(_) => &EMPTY,
        }
    }

    pub fn access_list(&self) -> &[AccessTuple] {
        match self {
            Self::AccessList(tx) => &tx.access_list,
            Self::DynamicFee(tx) => &tx.access_list,
            _ => &[],
        }
    }

    /// Declared sender of Klaytn-style variants.
    pub fn declared_from(&self) -> Option<Address> {
        match self {
            Self::FeeDelegated(tx) | Self::FeeDelegatedWithRatio(tx, _) => Some(tx.from),
            Self::Cancel(tx) => Some(tx.from),
            Self::ChainDataAnchoring(tx) => Some(tx.from),
            _ => None,
        }
    }

    pub fn fee_ratio(&self) -> Option<FeeRatio> {
        match self {
            Self::FeeDelegatedWithRatio(_, ratio) => Some(*ratio),
            _ => None,
        }
    }

    /// Explicit chain id of Ethereum typed variants.
    pub fn explicit_chain_id(&self) -> Option<u64> {
        match self {
            Self::AccessList(tx) => Some(tx.chain_id),
            Self::DynamicFee(tx) => Some(tx.chain_id),
            _ => None,
        }
    }

    /// Gas charged before execution starts.
    pub fn intrinsic_gas(&self) -> Result<u64, TxError> {
        let base = match self {
            Self::Legacy(tx) => creation_aware_base(tx.to),
            Self::AccessList(tx) => creation_aware_base(tx.to),
            Self::DynamicFee(tx) => creation_aware_base(tx.to),
            Self::FeeDelegated(_) => params::TX_GAS + params::TX_GAS_FEE_DELEGATED,
            Self::FeeDelegatedWithRatio(..) => {
                params::TX_GAS + params::TX_GAS_FEE_DELEGATED_WITH_RATIO
            }
            Self::Cancel(_) => params::TX_GAS_CANCEL,
            Self::ChainDataAnchoring(_) => params::TX_GAS_CHAIN_DATA_ANCHORING,
        };
        let data_gas = match self {
            Self::ChainDataAnchoring(tx) => {
                u64::try_from(tx.anchored_data.len())
                    .ok()
                    .and_then(|len| len.checked_mul(params::TX_DATA_GAS))
                    .ok_or(TxError::IntrinsicGasOverflow)?
            }
            other => calldata_gas(other.input())?,
        };
        let mut access_gas = 0u64;
        for tuple in self.access_list() {
            let keys = u64::try_from(tuple.storage_keys.len())
                .map_err(|_| TxError::IntrinsicGasOverflow)?;
            access_gas = access_gas
                .checked_add(params::TX_ACCESS_LIST_ADDRESS_GAS)
                .and_then(|gas| {
                    gas.checked_add(keys.checked_mul(params::TX_ACCESS_LIST_STORAGE_KEY_GAS)?)
                })
                .ok_or(TxError::IntrinsicGasOverflow)?;
        }
        base.checked_add(data_gas)
            .and_then(|gas| gas.checked_add(access_gas))
            .ok_or(TxError::IntrinsicGasOverflow)
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Legacy(tx) => tx.fields_len(),
            Self::FeeDelegated(tx) => tx.fields_len(),
            Self::FeeDelegatedWithRatio(tx, ratio) => tx.fields_len() + ratio.0.length(),
            Self::Cancel(tx) => tx.fields_len(),
            Self::ChainDataAnchoring(tx) => tx.fields_len(),
            Self::AccessList(tx) => tx.fields_len(),
            Self::DynamicFee(tx) => tx.fields_len(),
        }
    }

    fn encode_payload(&self, out: &mut dyn BufMut) {
        match self {
            Self::Legacy(tx) => tx.encode_fields(out),
            Self::FeeDelegated(tx) => tx.encode_fields(out),
            Self::FeeDelegatedWithRatio(tx, ratio) => {
                tx.encode_fields(out);
                ratio.0.encode(out);
            }
            Self::Cancel(tx) => tx.encode_fields(out),
            Self::ChainDataAnchoring(tx) => tx.encode_fields(out),
            Self::AccessList(tx) => tx.encode_fields(out),
            Self::DynamicFee(tx) => tx.encode_fields(out),
        }
    }

    fn decode_payload(tx_type: TxType, buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        Ok(match tx_type {
            TxType::Legacy => Self::Legacy(LegacyTx::decode_fields(buf)?),
            TxType::FeeDelegatedValueTransfer => {
                Self::FeeDelegated(FeeDelegatedTx::decode_fields(buf)?)
            }
            TxType::FeeDelegatedValueTransferWithRatio => {
                let tx = FeeDelegatedTx::decode_fields(buf)?;
                Self::FeeDelegatedWithRatio(tx, FeeRatio(u8::decode(buf)?))
            }
            TxType::Cancel => Self::Cancel(CancelTx::decode_fields(buf)?),
            TxType::ChainDataAnchoring => {
                Self::ChainDataAnchoring(AnchoringTx::decode_fields(buf)?)
            }
            TxType::EthereumAccessList => Self::AccessList(AccessListTx::decode_fields(buf)?),
            TxType::EthereumDynamicFee => Self::DynamicFee(DynamicFeeTx::decode_fields(buf)?),
        })
    }

    /// Hash the sender signs over.
    pub fn signing_hash(&self, chain_id: u64) -> B256 {
        let mut buf = Vec::new();
        match self.tx_type() {
            TxType::Legacy => {
                let payload_length = self.payload_len() + chain_id.length() + 2;
                RlpHeader {
                    list: true,
                    payload_length,
                }
                .encode(&mut buf);
                self.encode_payload(&mut buf);
                chain_id.encode(&mut buf);
                0u8.encode(&mut buf);
                0u8.encode(&mut buf);
            }
            tx_type if tx_type.is_ethereum_typed() => {
                buf.extend_from_slice(&tx_type.prefix()[1..]);
                RlpHeader {
                    list: true,
                    payload_length: self.payload_len(),
                }
                .encode(&mut buf);
                self.encode_payload(&mut buf);
            }
            _ => {
                let inner = Bytes::from(self.typed_inner());
                let payload_length = inner.length() + chain_id.length() + 2;
                RlpHeader {
                    list: true,
                    payload_length,
                }
                .encode(&mut buf);
                inner.encode(&mut buf);
                chain_id.encode(&mut buf);
                0u8.encode(&mut buf);
                0u8.encode(&mut buf);
            }
        }
        keccak256(buf)
    }

    /// Hash the fee payer signs over.
    pub fn fee_payer_signing_hash(&self, fee_payer: Address, chain_id: u64) -> B256 {
        let inner = Bytes::from(self.typed_inner());
        let payload_length = inner.length() + fee_payer.length() + chain_id.length() + 2;
        let mut buf = Vec::new();
        RlpHeader {
            list: true,
            payload_length,
        }
        .encode(&mut buf);
        inner.encode(&mut buf);
        fee_payer.encode(&mut buf);
        chain_id.encode(&mut buf);
        0u8.encode(&mut buf);
        0u8.encode(&mut buf);
        keccak256(buf)
    }

    /// `rlp([type, fields...])`, the signed core of Klaytn-style variants.
    fn typed_inner(&self) -> Vec<u8> {
        let code = self.tx_type().code();
        let mut buf = Vec::new();
        RlpHeader {
            list: true,
            payload_length: code.length() + self.payload_len(),
        }
        .encode(&mut buf);
        code.encode(&mut buf);
        self.encode_payload(&mut buf);
        buf
    }
}

fn creation_aware_base(to: TxKind) -> u64 {
    if to.is_create() {
        params::TX_GAS_CONTRACT_CREATION
    } else {
        params::TX_GAS
    }
}

fn calldata_gas(data: &[u8]) -> Result<u64, TxError> {
    let zeros = data.iter().filter(|byte| **byte == 0).count();
    let non_zeros = data.len() - zeros;
    let zeros = u64::try_from(zeros).map_err(|_| TxError::IntrinsicGasOverflow)?;
    let non_zeros = u64::try_from(non_zeros).map_err(|_| TxError::IntrinsicGasOverflow)?;
    zeros
        .checked_mul(params::TX_DATA_ZERO_GAS)
        .and_then(|gas| gas.checked_add(non_zeros.checked_mul(params::TX_DATA_NON_ZERO_GAS)?))
        .ok_or(TxError::IntrinsicGasOverflow)
}

/// `v` carries the chain id for legacy and Klaytn-style variants
/// (`chain_id * 2 + 35 + parity`) and only the parity for Ethereum typed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxSignature {
    pub v: u64,
    pub r: U256,
    pub s: U256,
}
impl_rlp_fields!(TxSignature { v, r, s });

impl TxSignature {
    pub fn from_parity(signature: &Signature, chain_id: Option<u64>) -> Self {
        let parity = u64::from(signature.v());
        let v = match chain_id {
            Some(chain_id) => chain_id * 2 + 35 + parity,
            None => parity,
        };
        Self {
            v,
            r: signature.r(),
            s: signature.s(),
        }
    }

    fn parity(&self, eip155: bool) -> Result<bool, TxError> {
        let parity = if eip155 {
            if self.v < 35 {
                return Err(TxError::InvalidSig);
            }
            (self.v - 35) % 2
        } else {
            self.v
        };
        match parity {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(TxError::InvalidSig),
        }
    }

    fn chain_id(&self) -> Option<u64> {
        (self.v >= 35).then(|| (self.v - 35) / 2)
    }

    fn recover(&self, hash: &B256, eip155: bool) -> Result<Address, TxError> {
        if self.r.is_zero() || self.s.is_zero() {
            return Err(TxError::InvalidSig);
        }
        let signature = Signature::new(self.r, self.s, self.parity(eip155)?);
        signature
            .recover_address_from_prehash(hash)
            .map_err(|_| TxError::InvalidSig)
    }
}

/// Fee payer of a fee-delegated transaction and its signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePayerSig {
    pub address: Address,
    pub signature: TxSignature,
}

/// A signed transaction.
///
/// Hash and encoded size are computed once at construction; the recovered
/// sender and fee payer are cached on first successful recovery.
#[derive(Debug, Clone)]
pub struct Transaction {
    data: TxData,
    signature: TxSignature,
    fee_payer: Option<FeePayerSig>,
    hash: B256,
    size: usize,
    sender: OnceLock<Address>,
    validated_fee_payer: OnceLock<Address>,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Transaction {}

impl Transaction {
    pub fn new(data: TxData, signature: TxSignature, fee_payer: Option<FeePayerSig>) -> Self {
        let mut tx = Self {
            data,
            signature,
            fee_payer,
            hash: B256::ZERO,
            size: 0,
            sender: OnceLock::new(),
            validated_fee_payer: OnceLock::new(),
        };
        let envelope = tx.envelope();
        tx.size = envelope.len();
        tx.hash = keccak256(&envelope);
        tx
    }

    pub fn data(&self) -> &TxData {
        &self.data
    }

    pub fn signature(&self) -> &TxSignature {
        &self.signature
    }

    pub fn fee_payer_signature(&self) -> Option<&FeePayerSig> {
        self.fee_payer.as_ref()
    }

    pub fn hash(&self) -> B256 {
        self.hash
    }

    /// Size of the encoded envelope in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn tx_type(&self) -> TxType {
        self.data.tx_type()
    }

    pub fn nonce(&self) -> u64 {
        self.data.nonce()
    }

    pub fn gas(&self) -> u64 {
        self.data.gas()
    }

    pub fn gas_price(&self) -> U256 {
        self.data.gas_price()
    }

    pub fn gas_fee_cap(&self) -> U256 {
        self.data.gas_fee_cap()
    }

    pub fn gas_tip_cap(&self) -> U256 {
        self.data.gas_tip_cap()
    }

    pub fn to(&self) -> TxKind {
        self.data.to()
    }

    pub fn value(&self) -> U256 {
        self.data.value()
    }

    pub fn input(&self) -> &Bytes {
        self.data.input()
    }

    pub fn fee_ratio(&self) -> Option<FeeRatio> {
        self.data.fee_ratio()
    }

    pub fn is_fee_delegated(&self) -> bool {
        self.tx_type().is_fee_delegated()
    }

    pub fn intrinsic_gas(&self) -> Result<u64, TxError> {
        self.data.intrinsic_gas()
    }

    /// Total fee budget, `gas * gas_price`.
    pub fn fee(&self) -> U256 {
        U256::from(self.gas()) * self.gas_price()
    }

    /// Value plus fee budget.
    pub fn cost(&self) -> U256 {
        self.value() + self.fee()
    }

    /// Chain id carried by the transaction, if any.
    pub fn chain_id(&self) -> Option<u64> {
        self.data
            .explicit_chain_id()
            .or_else(|| self.signature.chain_id())
    }

    /// Address that declared to pay the fee. Equal to the sender for
    /// non-delegated variants.
    pub fn fee_payer(&self) -> Option<Address> {
        self.fee_payer.map(|fee_payer| fee_payer.address)
    }

    /// Recovers and caches the sender.
    pub fn sender(&self, chain_id: u64) -> Result<Address, TxError> {
        if self.chain_id() != Some(chain_id) {
            return Err(TxError::InvalidChainId);
        }
        if let Some(sender) = self.sender.get() {
            return Ok(*sender);
        }
        let hash = self.data.signing_hash(chain_id);
        let eip155 = !self.tx_type().is_ethereum_typed();
        let recovered = self.signature.recover(&hash, eip155)?;
        if let Some(declared) = self.data.declared_from() {
            if declared != recovered {
                return Err(TxError::InvalidSender {
                    recovered,
                    declared,
                });
            }
        }
        Ok(*self.sender.get_or_init(|| recovered))
    }

    /// Cached sender, when recovery has already run.
    pub fn cached_sender(&self) -> Option<Address> {
        self.sender.get().copied()
    }

    /// Recovers the fee payer of delegated variants and checks it against
    /// the declared address. Non-delegated variants return the sender.
    pub fn validated_fee_payer(&self, chain_id: u64) -> Result<Address, TxError> {
        if !self.is_fee_delegated() {
            return self.sender(chain_id);
        }
        if let Some(fee_payer) = self.validated_fee_payer.get() {
            return Ok(*fee_payer);
        }
        let Some(fee_payer) = self.fee_payer else {
            return Err(TxError::InvalidSig);
        };
        let hash = self
            .data
            .fee_payer_signing_hash(fee_payer.address, chain_id);
        let recovered = fee_payer.signature.recover(&hash, true)?;
        if recovered != fee_payer.address {
            return Err(TxError::InvalidFeePayer {
                recovered,
                declared: fee_payer.address,
            });
        }
        Ok(*self.validated_fee_payer.get_or_init(|| recovered))
    }

    /// Stateless checks that apply to the variant regardless of chain state.
    pub fn validate_stateless(&self) -> Result<(), TxError> {
        match &self.data {
            TxData::FeeDelegatedWithRatio(_, ratio) if !ratio.is_valid() => {
                Err(TxError::FeeRatioOutOfRange)
            }
            TxData::ChainDataAnchoring(tx) if tx.anchored_data.is_empty() => {
                Err(TxError::EmptyAnchoredData)
            }
            _ => Ok(()),
        }
    }

    fn signed_payload_len(&self) -> usize {
        let mut len = self.data.payload_len() + self.signature.fields_len();
        if let Some(fee_payer) = &self.fee_payer {
            len += fee_payer.address.length() + fee_payer.signature.fields_len();
        }
        len
    }

    /// Canonical binary form: `prefix || rlp([fields..., v, r, s, fee_payer...])`.
    /// The transaction hash is the keccak of this.
    pub fn envelope(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.signed_payload_len() + 8);
        self.encode_envelope(&mut out);
        out
    }

    pub fn encode_envelope(&self, out: &mut dyn BufMut) {
        out.put_slice(self.tx_type().prefix());
        RlpHeader {
            list: true,
            payload_length: self.signed_payload_len(),
        }
        .encode(out);
        self.data.encode_payload(out);
        self.signature.encode_fields(out);
        if let Some(fee_payer) = &self.fee_payer {
            fee_payer.address.encode(out);
            fee_payer.signature.encode_fields(out);
        }
    }

    fn envelope_len(&self) -> usize {
        let payload_length = self.signed_payload_len();
        self.tx_type().prefix().len() + payload_length + alloy_rlp::length_of_length(payload_length)
    }

    /// Decodes the canonical binary form produced by [`Transaction::envelope`].
    pub fn decode_envelope(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let first = *buf.first().ok_or(alloy_rlp::Error::InputTooShort)?;
        let tx_type = match first {
            0xc0..=0xff => TxType::Legacy,
            0x09 => TxType::FeeDelegatedValueTransfer,
            0x0a => TxType::FeeDelegatedValueTransferWithRatio,
            0x38 => TxType::Cancel,
            0x48 => TxType::ChainDataAnchoring,
            ETH_TX_TYPE_ENVELOPE => match buf.get(1) {
                Some(0x01) => TxType::EthereumAccessList,
                Some(0x02) => TxType::EthereumDynamicFee,
                _ => return Err(alloy_rlp::Error::Custom("unknown ethereum tx type")),
            },
            _ => return Err(alloy_rlp::Error::Custom("unknown tx type")),
        };
        *buf = &buf[tx_type.prefix().len()..];
        let rlp_head = RlpHeader::decode(buf)?;
        if !rlp_head.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let started_len = buf.len();
        let data = TxData::decode_payload(tx_type, buf)?;
        let signature = TxSignature::decode_fields(buf)?;
        let fee_payer = if tx_type.is_fee_delegated() {
            Some(FeePayerSig {
                address: Decodable::decode(buf)?,
                signature: TxSignature::decode_fields(buf)?,
            })
        } else {
            None
        };
        let consumed = started_len - buf.len();
        if consumed != rlp_head.payload_length {
            return Err(alloy_rlp::Error::ListLengthMismatch {
                expected: rlp_head.payload_length,
                got: consumed,
            });
        }
        Ok(Self::new(data, signature, fee_payer))
    }
}

/// Block-body form: legacy transactions are embedded as lists, typed ones as
/// byte strings wrapping their envelope.
impl Encodable for Transaction {
    fn encode(&self, out: &mut dyn BufMut) {
        if self.tx_type() != TxType::Legacy {
            RlpHeader {
                list: false,
                payload_length: self.envelope_len(),
            }
            .encode(out);
        }
        self.encode_envelope(out);
    }

    fn length(&self) -> usize {
        let envelope_len = self.envelope_len();
        if self.tx_type() == TxType::Legacy {
            envelope_len
        } else {
            envelope_len + alloy_rlp::length_of_length(envelope_len)
        }
    }
}

impl Decodable for Transaction {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let first = *buf.first().ok_or(alloy_rlp::Error::InputTooShort)?;
        if first >= 0xc0 {
            return Self::decode_envelope(buf);
        }
        let rlp_head = RlpHeader::decode(buf)?;
        if rlp_head.list {
            return Err(alloy_rlp::Error::UnexpectedList);
        }
        let (mut envelope, rest) = buf.split_at(rlp_head.payload_length);
        let tx = Self::decode_envelope(&mut envelope)?;
        if !envelope.is_empty() {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }
        *buf = rest;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        TestKey,
        TEST_CHAIN_ID,
    };

    fn legacy(nonce: u64) -> TxData {
        TxData::Legacy(LegacyTx {
            nonce,
            gas_price: U256::from(25),
            gas: 21_000,
            to: TxKind::Call(Address::repeat_byte(0xaa)),
            value: U256::from(1_000),
            input: Bytes::new(),
        })
    }

    #[test]
    fn legacy_sender_recovers() {
        let key = TestKey::from_seed(1);
        let tx = key.sign(legacy(0));
        assert_eq!(tx.sender(TEST_CHAIN_ID).unwrap(), key.address());
        assert_eq!(tx.chain_id(), Some(TEST_CHAIN_ID));
        assert_eq!(
            tx.sender(TEST_CHAIN_ID + 1),
            Err(TxError::InvalidChainId),
            "a cached sender must not bypass the chain id check"
        );
    }

    #[test]
    fn envelope_decodes_every_variant() {
        let sender = TestKey::from_seed(2);
        let payer = TestKey::from_seed(3);
        let variants = vec![
            sender.sign(legacy(1)),
            sender.sign_fee_delegated(
                TxData::FeeDelegatedWithRatio(
                    FeeDelegatedTx {
                        nonce: 2,
                        gas_price: U256::from(25),
                        gas: 60_000,
                        to: Address::repeat_byte(1),
                        value: U256::from(5),
                        from: sender.address(),
                    },
                    FeeRatio(30),
                ),
                &payer,
            ),
            sender.sign(TxData::DynamicFee(DynamicFeeTx {
                chain_id: TEST_CHAIN_ID,
                nonce: 3,
                gas_tip_cap: U256::from(1),
                gas_fee_cap: U256::from(30),
                gas: 21_000,
                to: TxKind::Create,
                value: U256::ZERO,
                input: Bytes::from_static(&[0, 1, 2]),
                access_list: vec![AccessTuple {
                    address: Address::repeat_byte(9),
                    storage_keys: vec![B256::ZERO],
                }],
            })),
        ];
        for tx in variants {
            let decoded = Transaction::decode_envelope(&mut tx.envelope().as_slice()).unwrap();
            assert_eq!(decoded.hash(), tx.hash());
            assert_eq!(decoded.data(), tx.data());
            let body_form = alloy_rlp::encode(&tx);
            assert_eq!(body_form.len(), tx.length());
            let decoded = Transaction::decode(&mut body_form.as_slice()).unwrap();
            assert_eq!(decoded.hash(), tx.hash(), "body form must round-trip {:?}", tx.tx_type());
        }
    }

    #[test]
    fn fee_payer_signature_is_checked() {
        let sender = TestKey::from_seed(4);
        let payer = TestKey::from_seed(5);
        let data = TxData::FeeDelegated(FeeDelegatedTx {
            nonce: 0,
            gas_price: U256::from(25),
            gas: 40_000,
            to: Address::repeat_byte(1),
            value: U256::from(1),
            from: sender.address(),
        });
        let tx = sender.sign_fee_delegated(data.clone(), &payer);
        assert_eq!(tx.validated_fee_payer(TEST_CHAIN_ID).unwrap(), payer.address());

        let forged = Transaction::new(
            data,
            *tx.signature(),
            Some(FeePayerSig {
                address: Address::repeat_byte(7),
                signature: tx.fee_payer_signature().unwrap().signature,
            }),
        );
        assert!(matches!(
            forged.validated_fee_payer(TEST_CHAIN_ID),
            Err(TxError::InvalidFeePayer { .. })
        ));
    }

    #[test]
    fn declared_sender_must_match_signer() {
        let signer = TestKey::from_seed(6);
        let tx = signer.sign(TxData::Cancel(CancelTx {
            nonce: 0,
            gas_price: U256::from(25),
            gas: 21_000,
            from: Address::repeat_byte(0x11),
        }));
        assert!(matches!(
            tx.sender(TEST_CHAIN_ID),
            Err(TxError::InvalidSender { .. })
        ));
    }

    #[test]
    fn intrinsic_gas_by_variant() {
        assert_eq!(legacy(0).intrinsic_gas().unwrap(), 21_000);
        let create = TxData::Legacy(LegacyTx {
            nonce: 0,
            gas_price: U256::from(1),
            gas: 100_000,
            to: TxKind::Create,
            value: U256::ZERO,
            input: Bytes::from_static(&[0, 0, 1]),
        });
        assert_eq!(create.intrinsic_gas().unwrap(), 53_000 + 4 + 4 + 16);
        let anchoring = TxData::ChainDataAnchoring(AnchoringTx {
            nonce: 0,
            gas_price: U256::from(1),
            gas: 100_000,
            from: Address::ZERO,
            anchored_data: Bytes::from_static(&[1, 2]),
        });
        assert_eq!(
            anchoring.intrinsic_gas().unwrap(),
            params::TX_GAS_CHAIN_DATA_ANCHORING + 2 * params::TX_DATA_GAS
        );
    }

    #[test]
    fn fee_ratio_split() {
        let (payer, sender) = FeeRatio(10).split(U256::from(100_000));
        assert_eq!(payer, U256::from(10_000));
        assert_eq!(sender, U256::from(90_000));
        assert!(!FeeRatio(0).is_valid());
        assert!(!FeeRatio(100).is_valid());
    }
}
