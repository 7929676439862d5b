use crate::types::ReceiptStatus;

/// Failure of a message execution.
///
/// Every kind maps to one receipt status. Kinds without a dedicated status
/// share [`ReceiptStatus::ErrDefault`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("Max call depth exceeded")]
    Depth,
    #[error("Contract address collision")]
    ContractAddressCollision,
    #[error("Contract creation code storage out of gas")]
    CodeStoreOutOfGas,
    #[error("Max code size exceeded")]
    MaxCodeSizeExceeded,
    #[error("Out of gas")]
    OutOfGas,
    #[error("Write protection")]
    WriteProtection,
    #[error("Execution reverted")]
    ExecutionReverted,
    #[error("Reached the opcode computation cost limit")]
    OpcodeComputationCostLimitReached,
    #[error("Account already exists")]
    AddressAlreadyExists,
    #[error("Not a program account")]
    NotProgramAccount,
    #[error("Not a human readable address")]
    NotHumanReadableAddress,
    #[error("Fee ratio is out of range [1, 99]")]
    FeeRatioOutOfRange,
    #[error("Account key cannot be updated")]
    AccountKeyFailNotUpdatable,
    #[error("Different account key type")]
    DifferentAccountKeyType,
    #[error("Account key nil cannot be initialized")]
    AccountKeyNilUninitializable,
    #[error("Public key is not on curve")]
    NotOnCurve,
    #[error("Key weight is zero")]
    ZeroKeyWeight,
    #[error("Key is not serializable")]
    UnserializableKey,
    #[error("Duplicated key")]
    DuplicatedKey,
    #[error("Weighted sum overflow")]
    WeightedSumOverflow,
    #[error("Unsatisfiable threshold")]
    UnsatisfiableThreshold,
    #[error("Key length is zero")]
    ZeroLength,
    #[error("Key length too long")]
    LengthTooLong,
    #[error("Nested role based key")]
    NestedRoleBasedKey,
    #[error("Legacy transaction must be with legacy account key")]
    LegacyTransactionMustBeWithLegacyKey,
    #[error("Deprecated feature")]
    Deprecated,
    #[error("Not supported")]
    NotSupported,
    #[error("Invalid code format")]
    InvalidCodeFormat,
    #[error("Execution failed")]
    Default,
    #[error("Invalid opcode 0x{0:02x}")]
    InvalidOpcode(u8),
    #[error("Stack underflow")]
    StackUnderflow,
    #[error("Insufficient balance for transfer")]
    InsufficientBalance,
    #[error("Reached the total execution time limit")]
    TotalTimeLimitReached,
    #[error("Invalid receipt status {0}")]
    InvalidReceiptStatus(u8),
}

impl VmError {
    /// Errors that invalidate the whole block instead of failing the
    /// transaction.
    pub fn is_consensus_fatal(&self) -> bool {
        matches!(self, Self::InsufficientBalance | Self::TotalTimeLimitReached)
    }

    pub fn receipt_status(&self) -> ReceiptStatus {
        use ReceiptStatus as S;
        match self {
            Self::Depth => S::ErrDepth,
            Self::ContractAddressCollision => S::ErrContractAddressCollision,
            Self::CodeStoreOutOfGas => S::ErrCodeStoreOutOfGas,
            Self::MaxCodeSizeExceeded => S::ErrMaxCodeSizeExceed,
            Self::OutOfGas => S::ErrOutOfGas,
            Self::WriteProtection => S::ErrWriteProtection,
            Self::ExecutionReverted => S::ErrExecutionReverted,
            Self::OpcodeComputationCostLimitReached => S::ErrOpcodeComputationCostLimitReached,
            Self::AddressAlreadyExists => S::ErrAddressAlreadyExists,
            Self::NotProgramAccount => S::ErrNotAProgramAccount,
            Self::NotHumanReadableAddress => S::ErrNotHumanReadableAddress,
            Self::FeeRatioOutOfRange => S::ErrFeeRatioOutOfRange,
            Self::AccountKeyFailNotUpdatable => S::ErrAccountKeyFailNotUpdatable,
            Self::DifferentAccountKeyType => S::ErrDifferentAccountKeyType,
            Self::AccountKeyNilUninitializable => S::ErrAccountKeyNilUninitializable,
            Self::NotOnCurve => S::ErrNotOnCurve,
            Self::ZeroKeyWeight => S::ErrZeroKeyWeight,
            Self::UnserializableKey => S::ErrUnserializableKey,
            Self::DuplicatedKey => S::ErrDuplicatedKey,
            Self::WeightedSumOverflow => S::ErrWeightedSumOverflow,
            Self::UnsatisfiableThreshold => S::ErrUnsatisfiableThreshold,
            Self::ZeroLength => S::ErrZeroLength,
            Self::LengthTooLong => S::ErrLengthTooLong,
            Self::NestedRoleBasedKey => S::ErrNestedRoleBasedKey,
            Self::LegacyTransactionMustBeWithLegacyKey => {
                S::ErrLegacyTransactionMustBeWithLegacyKey
            }
            Self::Deprecated => S::ErrDeprecated,
            Self::NotSupported => S::ErrNotSupported,
            Self::InvalidCodeFormat => S::ErrInvalidCodeFormat,
            Self::Default |
            Self::InvalidOpcode(_) |
            Self::StackUnderflow |
            Self::InsufficientBalance |
            Self::TotalTimeLimitReached |
            Self::InvalidReceiptStatus(_) => S::ErrDefault,
        }
    }

    /// Inverse of [`VmError::receipt_status`]. `None` for a successful
    /// receipt; the default bucket yields [`VmError::Default`].
    pub fn from_receipt_status(status: ReceiptStatus) -> Option<Self> {
        use ReceiptStatus as S;
        Some(match status {
            S::Successful => return None,
            S::Failed => Self::InvalidReceiptStatus(S::Failed as u8),
            S::ErrDefault => Self::Default,
            S::ErrDepth => Self::Depth,
            S::ErrContractAddressCollision => Self::ContractAddressCollision,
            S::ErrCodeStoreOutOfGas => Self::CodeStoreOutOfGas,
            S::ErrMaxCodeSizeExceed => Self::MaxCodeSizeExceeded,
            S::ErrOutOfGas => Self::OutOfGas,
            S::ErrWriteProtection => Self::WriteProtection,
            S::ErrExecutionReverted => Self::ExecutionReverted,
            S::ErrOpcodeComputationCostLimitReached => Self::OpcodeComputationCostLimitReached,
            S::ErrAddressAlreadyExists => Self::AddressAlreadyExists,
            S::ErrNotAProgramAccount => Self::NotProgramAccount,
            S::ErrNotHumanReadableAddress => Self::NotHumanReadableAddress,
            S::ErrFeeRatioOutOfRange => Self::FeeRatioOutOfRange,
            S::ErrAccountKeyFailNotUpdatable => Self::AccountKeyFailNotUpdatable,
            S::ErrDifferentAccountKeyType => Self::DifferentAccountKeyType,
            S::ErrAccountKeyNilUninitializable => Self::AccountKeyNilUninitializable,
            S::ErrNotOnCurve => Self::NotOnCurve,
            S::ErrZeroKeyWeight => Self::ZeroKeyWeight,
            S::ErrUnserializableKey => Self::UnserializableKey,
            S::ErrDuplicatedKey => Self::DuplicatedKey,
            S::ErrWeightedSumOverflow => Self::WeightedSumOverflow,
            S::ErrUnsatisfiableThreshold => Self::UnsatisfiableThreshold,
            S::ErrZeroLength => Self::ZeroLength,
            S::ErrLengthTooLong => Self::LengthTooLong,
            S::ErrNestedRoleBasedKey => Self::NestedRoleBasedKey,
            S::ErrLegacyTransactionMustBeWithLegacyKey => {
                Self::LegacyTransactionMustBeWithLegacyKey
            }
            S::ErrDeprecated => Self::Deprecated,
            S::ErrNotSupported => Self::NotSupported,
            S::ErrInvalidCodeFormat => Self::InvalidCodeFormat,
        })
    }
}

/// Receipt status of an execution that ended with `err`.
pub fn receipt_status(err: Option<&VmError>) -> ReceiptStatus {
    err.map_or(ReceiptStatus::Successful, VmError::receipt_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table_is_bijective_outside_the_default_bucket() {
        for code in 2..=ReceiptStatus::LAST as u8 {
            let status = ReceiptStatus::from_u8(code).unwrap();
            let err = VmError::from_receipt_status(status).unwrap();
            assert_eq!(err.receipt_status(), status, "status 0x{code:02x} must round-trip");
        }
        assert_eq!(VmError::from_receipt_status(ReceiptStatus::Successful), None);
        assert_eq!(receipt_status(None), ReceiptStatus::Successful);
    }

    #[test]
    fn unmapped_errors_use_the_default_bucket() {
        assert_eq!(VmError::InvalidOpcode(0xef).receipt_status(), ReceiptStatus::ErrDefault);
        assert_eq!(VmError::StackUnderflow.receipt_status(), ReceiptStatus::ErrDefault);
        assert!(VmError::InsufficientBalance.is_consensus_fatal());
        assert!(!VmError::OutOfGas.is_consensus_fatal());
    }
}
