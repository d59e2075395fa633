//! Pure state transition function
//!
//! Bridge lifecycle rules live here as a pure, synchronous function:
//! `next_state(state, input) -> Option<state>`. `None` means the input does
//! not change the state, so nothing is broadcast.

use vibecheck_protocol::BridgeState;

// ---------------------------------------------------------------------------
// Input: everything that can move a bridge between states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// A user message was queued for the worker.
    MessageQueued,
    ApprovalRequested,
    ApprovalResolved,
    InputRequested,
    InputResolved,
    /// A turn finished (or failed). `queue_drained` is true when no further
    /// messages are waiting; `has_pending` when approvals or inputs remain.
    TurnSettled {
        queue_drained: bool,
        has_pending: bool,
    },
    /// A message was refused (observe-only bridge or no runtime).
    Rejected,
    /// Explicit teardown.
    Stopped,
}

pub fn next_state(current: BridgeState, input: Input) -> Option<BridgeState> {
    use BridgeState::*;

    if current == Disconnected {
        return None;
    }

    let target = match input {
        Input::MessageQueued => Running,
        Input::ApprovalRequested => WaitingApproval,
        Input::InputRequested => WaitingInput,
        Input::ApprovalResolved | Input::InputResolved => Running,
        Input::TurnSettled {
            queue_drained,
            has_pending,
        } => {
            if current == Running && queue_drained && !has_pending {
                Idle
            } else {
                return None;
            }
        }
        Input::Rejected => Idle,
        Input::Stopped => Disconnected,
    };

    (target != current).then_some(target)
}
