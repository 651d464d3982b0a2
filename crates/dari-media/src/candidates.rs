//! Buffer for remote ICE candidates that arrive before the remote
//! description.
//!
//! A peer connection rejects candidates until it knows the remote session
//! description, but the mailbox delivers candidates and descriptions on
//! independent channels. The queue holds early candidates and releases them,
//! in arrival order, once the description is in place.

use std::collections::VecDeque;

use dari_shared::IceCandidate;

/// What to do with a candidate handed to [`CandidateQueue::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The remote description is set; apply it now.
    Apply(IceCandidate),
    /// Held until [`CandidateQueue::open`].
    Buffered,
}

#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    open: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, candidate: IceCandidate) -> Admission {
        if self.open {
            Admission::Apply(candidate)
        } else {
            self.pending.push_back(candidate);
            Admission::Buffered
        }
    }

    /// Mark the remote description as applied and hand back everything
    /// buffered so far, oldest first. Later calls return nothing.
    pub fn open(&mut self) -> Vec<IceCandidate> {
        self.open = true;
        self.pending.drain(..).collect()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
