//! MAC commands
//!
//! Uplink MAC commands arrive either piggybacked in FOpts or as the
//! FRMPayload of a port-0 frame. Each command is a CID byte followed by a
//! fixed-size payload whose length depends on the CID and direction.

use crate::error::DecodeError;
use std::fmt;

/// MAC command identifier (LoRaWAN 1.0.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cid {
    LinkCheck = 0x02,
    LinkAdr = 0x03,
    DutyCycle = 0x04,
    RxParamSetup = 0x05,
    DevStatus = 0x06,
    NewChannel = 0x07,
    RxTimingSetup = 0x08,
    TxParamSetup = 0x09,
    DlChannel = 0x0a,
}

impl Cid {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Cid::LinkCheck),
            0x03 => Some(Cid::LinkAdr),
            0x04 => Some(Cid::DutyCycle),
            0x05 => Some(Cid::RxParamSetup),
            0x06 => Some(Cid::DevStatus),
            0x07 => Some(Cid::NewChannel),
            0x08 => Some(Cid::RxTimingSetup),
            0x09 => Some(Cid::TxParamSetup),
            0x0a => Some(Cid::DlChannel),
            _ => None,
        }
    }

    /// Payload size of the device-to-network variant (Req or Ans)
    pub fn uplink_payload_len(&self) -> usize {
        match self {
            Cid::LinkCheck => 0,
            Cid::LinkAdr => 1,
            Cid::DutyCycle => 0,
            Cid::RxParamSetup => 1,
            Cid::DevStatus => 2,
            Cid::NewChannel => 1,
            Cid::RxTimingSetup => 0,
            Cid::TxParamSetup => 0,
            Cid::DlChannel => 1,
        }
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cid::LinkCheck => "LinkCheckReq",
            Cid::LinkAdr => "LinkADRAns",
            Cid::DutyCycle => "DutyCycleAns",
            Cid::RxParamSetup => "RXParamSetupAns",
            Cid::DevStatus => "DevStatusAns",
            Cid::NewChannel => "NewChannelAns",
            Cid::RxTimingSetup => "RXTimingSetupAns",
            Cid::TxParamSetup => "TxParamSetupAns",
            Cid::DlChannel => "DlChannelAns",
        };
        f.write_str(name)
    }
}

/// A single parsed MAC command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacCommand {
    pub cid: Cid,
    pub payload: Vec<u8>,
}

/// Parse the uplink MAC commands contained in `data`.
///
/// Parsing stops at the first unknown CID since its length cannot be
/// known; commands before it are still returned alongside the error.
pub fn parse_uplink_commands(data: &[u8]) -> (Vec<MacCommand>, Option<DecodeError>) {
    let mut commands = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let Some(cid) = Cid::from_u8(data[pos]) else {
            return (commands, Some(DecodeError::UnknownMacCommand(data[pos])));
        };
        let end = pos + 1 + cid.uplink_payload_len();
        if end > data.len() {
            return (
                commands,
                Some(DecodeError::TruncatedMacCommand {
                    cid: cid as u8,
                    offset: pos,
                }),
            );
        }
        commands.push(MacCommand {
            cid,
            payload: data[pos + 1..end].to_vec(),
        });
        pos = end;
    }

    (commands, None)
}
