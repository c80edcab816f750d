use thiserror::Error;

/// Reasons a state proof or a proof extension is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    #[error("initial state does not parse under the board rules")]
    UnparsableInitialState,

    #[error("initial state differs from the reinit state and lacks a quorum")]
    MissingInitialQuorum,

    #[error("transition {0}: new state does not parse under the board rules")]
    UnparsableNewState(usize),

    #[error("transition {0}: applied to a state where it is no player's turn")]
    TransitionFromNoTurn(usize),

    #[error("transition {0}: neither a valid signed move nor a state quorum")]
    UnjustifiedTransition(usize),

    #[error("proof end state does not parse under the board rules")]
    UnparsableEndState,

    #[error("cannot extend a proof in a no-turn state")]
    EndStateNoTurn,

    #[error("move is not valid in the current state")]
    InvalidMove,

    #[error("signer address does not belong to the acting participant")]
    WrongSigner,
}

/// Failure submitting a move transaction to the chain.
#[derive(Debug, Error)]
#[error("failed to submit move transaction: {0}")]
pub struct SendError(pub String);
