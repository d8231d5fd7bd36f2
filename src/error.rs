use crate::types::{Amount, TxId};
use thiserror::Error;

/// Payload and condition decode failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of payload")]
    UnexpectedEnd,
    #[error("trailing bytes after payload")]
    TrailingBytes,
    #[error("unknown funcid {0:#04x}")]
    UnknownFuncId(u8),
    #[error("unexpected eval code {0:#04x}")]
    UnexpectedEval(u8),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

/// Builder-side error. Returned to the caller; never stored in shared state.
#[derive(Error, Debug)]
pub enum CcError {
    #[error("invalid argument: {0}")]
    InputInvalid(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Amount, available: Amount },
    #[error("unauthorised: {0}")]
    Unauthorised(String),
    #[error("state gate: {0}")]
    StateGate(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("signing failed: {0}")]
    Signing(String),
}

impl CcError {
    pub fn not_found(what: impl Into<String>) -> Self {
        CcError::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        CcError::InputInvalid(what.into())
    }
}

/// Consensus-side error. Any variant rejects the transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("could not decode op-return: {0}")]
    Opret(#[from] DecodeError),
    #[error("token inputs {inputs} != outputs {outputs} for tokenid {tokenid}")]
    Conservation {
        tokenid: TxId,
        inputs: Amount,
        outputs: Amount,
    },
    #[error("marker spend not allowed for tokenid {0}")]
    MarkerSpend(TxId),
    #[error("unit price {found} does not preserve predecessor price {expected}")]
    UnitPrice { expected: Amount, found: Amount },
    #[error("royalty vout {found} != required {required}")]
    Royalty { required: Amount, found: Amount },
    #[error("no predicate registered for eval code {0:#04x}")]
    UnknownEval(u8),
}

impl ValidationError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ValidationError::Invalid(reason.into())
    }
}
