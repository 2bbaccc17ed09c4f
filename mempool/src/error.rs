use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("tx already exists in cache")]
    TxInCache,

    #[error("tx too large: {size} bytes, max {max}")]
    TxTooLarge { size: usize, max: usize },

    #[error("tx rejected: {0}")]
    Rejected(String),

    #[error("mempool is full: {txs} txs, {bytes} bytes")]
    MempoolIsFull { txs: usize, bytes: usize },

    #[error("no free peer ids: {0} already active")]
    IdSpaceExhausted(usize),
}
