use std::collections::BTreeMap;

use crate::error::PipeError;
use crate::pipe::message::Domain;

/// Life cycle of a pipe. A pipe only ever moves forward through these states; `Closed` and
///  `Error` are terminal and can be reached from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Uninitialized,
    ClientConnecting,
    ClientWaitingForAllowance,
    ServerWaitingForBrochure,
    ClientEstablishingChannels,
    ServerEstablishingChannels,
    Established,
    Closing,
    Closed,
    Error,
}

impl PipeState {
    fn rank(&self) -> u8 {
        match self {
            PipeState::Uninitialized => 0,
            PipeState::ClientConnecting => 1,
            PipeState::ClientWaitingForAllowance => 2,
            PipeState::ServerWaitingForBrochure => 2,
            PipeState::ClientEstablishingChannels => 3,
            PipeState::ServerEstablishingChannels => 3,
            PipeState::Established => 4,
            PipeState::Closing => 5,
            PipeState::Closed => 6,
            PipeState::Error => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipeState::Closed | PipeState::Error)
    }

    /// still negotiating, i.e. reads and writes are queued
    pub fn is_handshake(&self) -> bool {
        self.rank() < PipeState::Established.rank()
    }

    fn is_client(&self) -> bool {
        matches!(self, PipeState::ClientConnecting | PipeState::ClientWaitingForAllowance | PipeState::ClientEstablishingChannels)
    }

    fn is_server(&self) -> bool {
        matches!(self, PipeState::ServerWaitingForBrochure | PipeState::ServerEstablishingChannels)
    }

    pub(crate) fn can_advance_to(&self, next: PipeState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if (self.is_client() && next.is_server()) || (self.is_server() && next.is_client()) {
            return false;
        }
        next.is_terminal() || next.rank() > self.rank()
    }
}

/// Snapshot of a pipe's externally visible state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeStatus {
    pub state: PipeState,
    /// the failure that ended the pipe, `Closed` if it was closed deliberately
    pub error: Option<PipeError>,
    /// name of the peer's context, known once the handshake got that far
    pub remote_name: Option<String>,
    pub transport: Option<String>,
    pub channels: BTreeMap<Domain, String>,
    /// number of dedicated auxiliary connections matched so far, including the switch of the
    ///  primary connection
    pub connections_matched: usize,
    pub connections_required: usize,
}

impl PipeStatus {
    pub(crate) fn new() -> PipeStatus {
        PipeStatus {
            state: PipeState::Uninitialized,
            error: None,
            remote_name: None,
            transport: None,
            channels: Default::default(),
            connections_matched: 0,
            connections_required: 0,
        }
    }
}
