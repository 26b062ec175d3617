use shared::domain::MembershipState;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStart {
    Started { attempt: u64 },
    AlreadyJoining,
    AlreadyJoined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveStart {
    Started,
    AlreadyLeaving,
    NotJoined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    pub previous: MembershipState,
    /// The leave request still has to go out for this transition.
    pub send_leave: bool,
}

#[derive(Debug, Default)]
pub struct MembershipMachine {
    state: MembershipState,
    leave_request_issued: bool,
    join_attempt: u64,
}

impl MembershipMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MembershipState {
        self.state
    }

    pub fn join_attempt(&self) -> u64 {
        self.join_attempt
    }

    pub fn begin_join(&mut self) -> Result<JoinStart, SyncError> {
        match self.state {
            MembershipState::Idle | MembershipState::Left => {
                self.state = MembershipState::Joining;
                self.leave_request_issued = false;
                self.join_attempt += 1;
                Ok(JoinStart::Started {
                    attempt: self.join_attempt,
                })
            }
            MembershipState::Joining => Ok(JoinStart::AlreadyJoining),
            MembershipState::Joined => Ok(JoinStart::AlreadyJoined),
            MembershipState::Leaving => Err(SyncError::InvalidState {
                operation: "join",
                state: self.state,
            }),
        }
    }

    /// Applies a server join confirmation. Confirmations outside `Joining`
    /// are stale and ignored.
    pub fn confirm_join(&mut self) -> bool {
        if self.state == MembershipState::Joining {
            self.state = MembershipState::Joined;
            true
        } else {
            false
        }
    }

    /// Returns to `Idle` if `attempt` is still the pending join.
    pub fn abort_join(&mut self, attempt: u64) -> bool {
        if self.state == MembershipState::Joining && self.join_attempt == attempt {
            self.state = MembershipState::Idle;
            true
        } else {
            false
        }
    }

    pub fn begin_leave(&mut self) -> Result<LeaveStart, SyncError> {
        match self.state {
            MembershipState::Joined => {
                self.state = MembershipState::Leaving;
                Ok(LeaveStart::Started)
            }
            MembershipState::Leaving => Ok(LeaveStart::AlreadyLeaving),
            MembershipState::Idle | MembershipState::Left => Ok(LeaveStart::NotJoined),
            MembershipState::Joining => Err(SyncError::InvalidState {
                operation: "leave",
                state: self.state,
            }),
        }
    }

    /// One-shot guard for the leave request of the current transition.
    pub fn take_leave_request(&mut self) -> bool {
        if self.state != MembershipState::Leaving || self.leave_request_issued {
            return false;
        }
        self.leave_request_issued = true;
        true
    }

    pub fn confirm_leave(&mut self) -> bool {
        if self.state == MembershipState::Leaving {
            self.state = MembershipState::Left;
            true
        } else {
            false
        }
    }

    /// Forces the machine to `Left` without waiting for any confirmation.
    pub fn teardown(&mut self) -> Teardown {
        let previous = self.state;
        let send_leave = match previous {
            MembershipState::Joined => true,
            MembershipState::Leaving => !self.leave_request_issued,
            _ => false,
        };
        if send_leave {
            self.leave_request_issued = true;
        }
        if previous != MembershipState::Idle {
            self.state = MembershipState::Left;
        }
        Teardown {
            previous,
            send_leave,
        }
    }

    pub fn require_joined(&self, operation: &'static str) -> Result<(), SyncError> {
        if self.state == MembershipState::Joined {
            Ok(())
        } else {
            Err(SyncError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}
