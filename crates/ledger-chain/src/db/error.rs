#[derive(thiserror::Error, Debug)]
pub enum DatabaseError {
    #[error("Sled error")]
    SledError(#[source] std::io::Error),
    #[error("Failed to decode {what}")]
    Decode {
        what: &'static str,
        #[source]
        source: alloy_rlp::Error,
    },
    #[error("Bincode error")]
    BincodeError(#[source] bincode::Error),
    #[error("State migration is already active at block {0}")]
    MigrationActive(u64),
    #[error("No state migration is active")]
    NoMigration,
}

pub type DatabaseResult<T = ()> = Result<T, DatabaseError>;

pub(crate) fn decode_err(what: &'static str) -> impl FnOnce(alloy_rlp::Error) -> DatabaseError {
    move |source| DatabaseError::Decode { what, source }
}
