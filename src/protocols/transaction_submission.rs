//! Reusable machine submitting one transaction through the chain adapter.
//!
//! Failures are never retried automatically: the user approves every retry,
//! and a retry re-queues exactly the same request.

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{transaction_action, with, ProcessId, ProtocolStateWithSharedData};
use crate::{
    actions::{TransactionAction, WalletAction},
    shared_data::SharedData,
    transactions::TransactionRequest,
    types::Hash,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    TransactionFailed,
    UserDeclinedRetry,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TransactionFailed => f.write_str("Transaction failed"),
            FailureReason::UserDeclinedRetry => f.write_str("User declined retry"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub process_id: ProcessId,
    pub request: TransactionRequest,
    /// Number of times the request was queued.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionSubmissionState {
    WaitForSend(Submission),
    WaitForSubmission(Submission),
    WaitForConfirmation {
        submission: Submission,
        transaction_hash: Hash,
    },
    ApproveRetry(Submission),
    Success {
        process_id: ProcessId,
    },
    Failure {
        process_id: ProcessId,
        reason: FailureReason,
    },
}

use TransactionSubmissionState::*;

impl TransactionSubmissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Success { .. } | Failure { .. })
    }

    /// Waiting for the user rather than for the chain.
    pub fn awaiting_user(&self) -> bool {
        matches!(self, ApproveRetry(_))
    }

    pub fn request(&self) -> Option<&TransactionRequest> {
        match self {
            WaitForSend(s) | WaitForSubmission(s) | ApproveRetry(s) => Some(&s.request),
            WaitForConfirmation { submission, .. } => Some(&submission.request),
            Success { .. } | Failure { .. } => None,
        }
    }
}

pub fn initialize(
    shared: SharedData,
    process_id: ProcessId,
    request: TransactionRequest,
) -> ProtocolStateWithSharedData<TransactionSubmissionState> {
    let shared = shared.queue_transaction(&process_id, request.clone());
    with(
        WaitForSend(Submission {
            process_id,
            request,
            attempts: 1,
        }),
        shared,
    )
}

pub fn reducer(
    state: TransactionSubmissionState,
    shared: SharedData,
    action: &WalletAction,
) -> ProtocolStateWithSharedData<TransactionSubmissionState> {
    let action = match transaction_action(action) {
        Some(action) => action,
        None => return with(state, shared),
    };

    match (state, action) {
        (WaitForSend(s), TransactionAction::Sent) => with(WaitForSubmission(s), shared),
        (WaitForSend(s), TransactionAction::SubmissionFailed { reason })
        | (WaitForSubmission(s), TransactionAction::SubmissionFailed { reason }) => {
            debug!(process_id = %s.process_id, %reason, "transaction submission failed");
            with(ApproveRetry(s), shared)
        }
        (WaitForSubmission(s), TransactionAction::Submitted { transaction_hash }) => with(
            WaitForConfirmation {
                submission: s,
                transaction_hash: *transaction_hash,
            },
            shared,
        ),
        (WaitForConfirmation { submission, .. }, TransactionAction::Confirmed) => with(
            Success {
                process_id: submission.process_id,
            },
            shared,
        ),
        (WaitForConfirmation { submission, .. }, TransactionAction::Failed) => with(
            Failure {
                process_id: submission.process_id,
                reason: FailureReason::TransactionFailed,
            },
            shared,
        ),
        (ApproveRetry(s), TransactionAction::RetryApproved) => {
            let shared = shared.queue_transaction(&s.process_id, s.request.clone());
            with(
                WaitForSend(Submission {
                    attempts: s.attempts + 1,
                    ..s
                }),
                shared,
            )
        }
        (ApproveRetry(s), TransactionAction::RetryDenied) => with(
            Failure {
                process_id: s.process_id,
                reason: FailureReason::UserDeclinedRetry,
            },
            shared,
        ),
        (state, _) => with(state, shared),
    }
}
