//! Work request lifecycle states and the re-entrant dispatch loop

use tracing::warn;

use super::WorkRequest;
use crate::transport::{CompletionStatus, Opcode};

/// Position of a work request in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    /// Idle in the pool, or posted and waiting for its first completion
    Free,
    /// A message landed in the header buffer
    RecvDone,
    /// Local execution (storage I/O) finished
    ExecDone,
    /// RDMA read from the peer finished
    ReadDone,
    /// RDMA write to the peer finished
    WriteDone,
    /// Send finished
    SendDone,
    /// Ready to return to the pool
    Destroy,
    /// A transport operation failed
    Error,
}

impl RequestStatus {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, target: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, target),
            (Free, RecvDone | SendDone)
                | (RecvDone, ExecDone | ReadDone | WriteDone | SendDone)
                | (ExecDone, WriteDone | SendDone)
                | (ReadDone, ExecDone | SendDone)
                | (WriteDone, SendDone)
                | (SendDone, Destroy)
                | (Destroy, Free)
                | (_, Error)
                | (_, Destroy)
        )
    }

    /// Status reached when a completion arrives
    pub fn on_completion(opcode: Opcode, status: CompletionStatus) -> Self {
        if !status.is_success() {
            return Self::Error;
        }
        match opcode {
            Opcode::Recv => Self::RecvDone,
            Opcode::Send => Self::SendDone,
            Opcode::RdmaRead => Self::ReadDone,
            Opcode::RdmaWrite => Self::WriteDone,
        }
    }
}

/// Outcome of one dispatch step
#[derive(Debug)]
pub enum Flow {
    /// The request changed state synchronously; run the next step now
    Continue(Box<WorkRequest>),
    /// The request was handed to the transport or the pool; a later
    /// completion (if any) resumes it
    Pending,
}

/// Run `step` until the request parks.
///
/// A step that returns `Continue` without changing the status would spin
/// forever; such a request is forced to `Error` (or to `Destroy` if it is
/// already in `Error`).
pub fn drive(mut req: Box<WorkRequest>, mut step: impl FnMut(Box<WorkRequest>) -> Flow) {
    loop {
        let before = req.status();
        match step(req) {
            Flow::Pending => return,
            Flow::Continue(mut next) => {
                if next.status() == before {
                    warn!(
                        "Request {} made no progress in {:?}, aborting",
                        next.id(),
                        before
                    );
                    let forced = if before == RequestStatus::Error {
                        RequestStatus::Destroy
                    } else {
                        RequestStatus::Error
                    };
                    next.set_status(forced);
                }
                req = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_read_path_is_valid() {
        use RequestStatus::*;
        let path = [Free, RecvDone, ExecDone, WriteDone, SendDone, Destroy, Free];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_server_write_path_is_valid() {
        use RequestStatus::*;
        let path = [Free, RecvDone, ReadDone, SendDone, Destroy, Free];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
    }

    #[test]
    fn test_invalid_transitions() {
        use RequestStatus::*;
        assert!(!Free.can_transition_to(ExecDone));
        assert!(!SendDone.can_transition_to(RecvDone));
        assert!(!WriteDone.can_transition_to(ReadDone));
        assert!(!Destroy.can_transition_to(RecvDone));
        assert!(SendDone.can_transition_to(Error));
    }

    #[test]
    fn test_completion_mapping() {
        assert_eq!(
            RequestStatus::on_completion(Opcode::Recv, CompletionStatus::Success),
            RequestStatus::RecvDone
        );
        assert_eq!(
            RequestStatus::on_completion(Opcode::RdmaWrite, CompletionStatus::Success),
            RequestStatus::WriteDone
        );
        assert_eq!(
            RequestStatus::on_completion(Opcode::RdmaRead, CompletionStatus::Success),
            RequestStatus::ReadDone
        );
        assert_eq!(
            RequestStatus::on_completion(Opcode::Send, CompletionStatus::RemoteAccessError),
            RequestStatus::Error
        );
    }
}
