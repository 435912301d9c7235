// loraflow - LoRaWAN network-server pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! LoRaWAN 1.0 frame structures and wire format
//!
//! This module defines the identifiers and the PHYPayload layout:
//!
//! ```text
//! PHYPayload: [MHDR: 1] [MACPayload: N] [MIC: 4]
//! MHDR:       [MType: 3 bits] [RFU: 3 bits] [Major: 2 bits]
//! FHDR:       [DevAddr: 4 LE] [FCtrl: 1] [FCnt: 2 LE] [FOpts: 0..15]
//! Data:       [FHDR] [FPort: 1]? [FRMPayload: M]?
//! ```
//!
//! Identifiers are held most-significant byte first (the way they are
//! printed) and reversed on the wire. Cryptographic operations on frames
//! live in [`crate::security`].

use crate::error::{DecodeError, EncodeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

/// Maximum FOpts length (4-bit FOptsLen)
pub const MAX_FOPTS_LEN: usize = 15;

/// Largest forward frame-counter jump still treated as "ahead"
pub const MAX_FCNT_GAP: u32 = 16_384;

/// Size of a join-request MAC payload
pub const JOIN_REQUEST_SIZE: usize = 18;

/// Fixed-size hex identifier with serde support through its string form.
macro_rules! hex_identifier {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Size in bytes
            pub const SIZE: usize = $len;

            /// Bytes in wire (little-endian) order
            pub fn to_le_bytes(&self) -> [u8; $len] {
                let mut out = self.0;
                out.reverse();
                out
            }

            /// Build from wire (little-endian) order
            pub fn from_le_bytes(mut bytes: [u8; $len]) -> Self {
                bytes.reverse();
                Self(bytes)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                if s.len() != $len * 2 || !s.is_ascii() {
                    return Err($crate::error::DecodeError::InvalidHex(s.to_string()));
                }
                let mut out = [0u8; $len];
                for (i, byte) in out.iter_mut().enumerate() {
                    *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                        .map_err(|_| $crate::error::DecodeError::InvalidHex(s.to_string()))?;
                }
                Ok(Self(out))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use hex_identifier;

hex_identifier!(
    /// 64-bit extended unique identifier (DevEUI, AppEUI, gateway EUI)
    Eui64,
    8
);

hex_identifier!(
    /// Device network address. Not globally unique.
    DevAddr,
    4
);

hex_identifier!(
    /// 24-bit network identifier
    NetId,
    3
);

impl NetId {
    /// 7 least significant bits, used as the DevAddr prefix
    pub fn nwk_id(&self) -> u8 {
        self.0[2] & 0x7f
    }
}

impl DevAddr {
    /// NwkID prefix (7 most significant bits)
    pub fn nwk_id(&self) -> u8 {
        self.0[0] >> 1
    }

    /// Random address carrying the NwkID of `net_id`
    pub fn random(net_id: NetId) -> Self {
        let mut bytes: [u8; 4] = rand::random();
        bytes[0] = (bytes[0] & 0x01) | (net_id.nwk_id() << 1);
        DevAddr(bytes)
    }
}

/// Device nonce sent in a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevNonce(pub u16);

impl fmt::Display for DevNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Application nonce sent in a join accept (wire order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AppNonce(pub [u8; 3]);

/// LoRaWAN message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MType {
    JoinRequest = 0,
    JoinAccept = 1,
    UnconfirmedDataUp = 2,
    UnconfirmedDataDown = 3,
    ConfirmedDataUp = 4,
    ConfirmedDataDown = 5,
    Rfu = 6,
    Proprietary = 7,
}

impl MType {
    /// Decode from the 3 MType bits
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedDataUp,
            3 => MType::UnconfirmedDataDown,
            4 => MType::ConfirmedDataUp,
            5 => MType::ConfirmedDataDown,
            6 => MType::Rfu,
            _ => MType::Proprietary,
        }
    }

    /// Sent by end devices
    pub fn is_uplink(&self) -> bool {
        matches!(
            self,
            MType::JoinRequest | MType::UnconfirmedDataUp | MType::ConfirmedDataUp
        )
    }

    /// Carries an FHDR
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            MType::UnconfirmedDataUp
                | MType::UnconfirmedDataDown
                | MType::ConfirmedDataUp
                | MType::ConfirmedDataDown
        )
    }

    /// Requests an acknowledgment from the receiver
    pub fn is_confirmed(&self) -> bool {
        matches!(self, MType::ConfirmedDataUp | MType::ConfirmedDataDown)
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MType::JoinRequest => "JoinRequest",
            MType::JoinAccept => "JoinAccept",
            MType::UnconfirmedDataUp => "UnconfirmedDataUp",
            MType::UnconfirmedDataDown => "UnconfirmedDataDown",
            MType::ConfirmedDataUp => "ConfirmedDataUp",
            MType::ConfirmedDataDown => "ConfirmedDataDown",
            MType::Rfu => "RFU",
            MType::Proprietary => "Proprietary",
        };
        f.write_str(name)
    }
}

/// LoRaWAN major version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Major {
    #[default]
    LoRaWanR1,
}

/// MAC header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mhdr {
    pub mtype: MType,
    pub major: Major,
}

impl Mhdr {
    /// LoRaWAN R1 header for the given type
    pub fn new(mtype: MType) -> Self {
        Self {
            mtype,
            major: Major::LoRaWanR1,
        }
    }

    pub fn to_byte(&self) -> u8 {
        (self.mtype as u8) << 5
    }

    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        let major = byte & 0x03;
        if major != 0 {
            return Err(DecodeError::UnsupportedMajor(major));
        }
        Ok(Self::new(MType::from_bits(byte >> 5)))
    }
}

/// Frame control byte
///
/// Bit 6 is ADRACKReq on uplinks and RFU on downlinks; bit 4 is FPending
/// on downlinks. Both are kept as read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub f_pending: bool,
}

impl FCtrl {
    fn to_byte(self, f_opts_len: usize) -> u8 {
        let mut b = (f_opts_len & 0x0f) as u8;
        if self.adr {
            b |= 0x80;
        }
        if self.adr_ack_req {
            b |= 0x40;
        }
        if self.ack {
            b |= 0x20;
        }
        if self.f_pending {
            b |= 0x10;
        }
        b
    }

    fn from_byte(b: u8) -> (Self, usize) {
        let ctrl = Self {
            adr: b & 0x80 != 0,
            adr_ack_req: b & 0x40 != 0,
            ack: b & 0x20 != 0,
            f_pending: b & 0x10 != 0,
        };
        (ctrl, (b & 0x0f) as usize)
    }
}

/// Frame header
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fhdr {
    pub dev_addr: DevAddr,
    pub f_ctrl: FCtrl,
    /// Low 16 bits of the frame counter
    pub f_cnt: u16,
    /// Piggybacked MAC commands (raw)
    pub f_opts: Vec<u8>,
}

/// MAC payload of a data frame
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataPayload {
    pub fhdr: Fhdr,
    pub f_port: Option<u8>,
    /// Encrypted on the wire, plaintext after decryption
    pub frm_payload: Vec<u8>,
}

/// MAC payload of a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequestPayload {
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: DevNonce,
}

/// Downlink settings advertised in a join accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DlSettings {
    pub rx1_dr_offset: u8,
    pub rx2_data_rate: u8,
}

/// MAC payload of a join accept (plaintext)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAcceptPayload {
    pub app_nonce: AppNonce,
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    pub dl_settings: DlSettings,
    /// RX1 delay in seconds (0 means 1)
    pub rx_delay: u8,
    /// Extra channel frequencies in Hz (at most 5)
    pub cf_list: Vec<u32>,
}

/// MAC payload variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacPayload {
    Data(DataPayload),
    JoinRequest(JoinRequestPayload),
    JoinAccept(JoinAcceptPayload),
    /// Proprietary or RFU content, kept opaque
    Raw(Vec<u8>),
}

/// A complete LoRaWAN frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhyPayload {
    pub mhdr: Mhdr,
    pub mac_payload: MacPayload,
    pub mic: [u8; MIC_SIZE],
}

impl PhyPayload {
    /// Frame with a zero MIC, to be signed later
    pub fn new(mtype: MType, mac_payload: MacPayload) -> Self {
        Self {
            mhdr: Mhdr::new(mtype),
            mac_payload,
            mic: [0; MIC_SIZE],
        }
    }

    /// Data payload, if this is a data frame
    pub fn data(&self) -> Option<&DataPayload> {
        match &self.mac_payload {
            MacPayload::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Mutable data payload, if this is a data frame
    pub fn data_mut(&mut self) -> Option<&mut DataPayload> {
        match &mut self.mac_payload {
            MacPayload::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Parse a frame from bytes.
    ///
    /// Join-accept payloads are read as plaintext; use
    /// [`PhyPayload::decrypt_join_accept`] for frames taken off the air.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 1 + MIC_SIZE {
            return Err(DecodeError::BufferTooShort {
                needed: 1 + MIC_SIZE,
                available: data.len(),
            });
        }

        let mhdr = Mhdr::from_byte(data[0])?;
        let body = &data[1..data.len() - MIC_SIZE];
        let mut mic = [0u8; MIC_SIZE];
        mic.copy_from_slice(&data[data.len() - MIC_SIZE..]);

        let mac_payload = match mhdr.mtype {
            MType::JoinRequest => MacPayload::JoinRequest(parse_join_request(body)?),
            MType::JoinAccept => MacPayload::JoinAccept(parse_join_accept(body)?),
            mtype if mtype.is_data() => MacPayload::Data(parse_data(body)?),
            _ => MacPayload::Raw(body.to_vec()),
        };

        Ok(Self {
            mhdr,
            mac_payload,
            mic,
        })
    }

    /// Serialize the MAC payload (without MHDR and MIC)
    pub fn mac_payload_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Vec::new();
        match &self.mac_payload {
            MacPayload::Data(data) => {
                if data.fhdr.f_opts.len() > MAX_FOPTS_LEN {
                    return Err(EncodeError::FOptsTooLong(data.fhdr.f_opts.len()));
                }
                if data.f_port.is_none() && !data.frm_payload.is_empty() {
                    return Err(EncodeError::MissingPort);
                }
                buf.extend_from_slice(&data.fhdr.dev_addr.to_le_bytes());
                buf.push(data.fhdr.f_ctrl.to_byte(data.fhdr.f_opts.len()));
                buf.extend_from_slice(&data.fhdr.f_cnt.to_le_bytes());
                buf.extend_from_slice(&data.fhdr.f_opts);
                if let Some(port) = data.f_port {
                    buf.push(port);
                    buf.extend_from_slice(&data.frm_payload);
                }
            }
            MacPayload::JoinRequest(jr) => {
                buf.extend_from_slice(&jr.app_eui.to_le_bytes());
                buf.extend_from_slice(&jr.dev_eui.to_le_bytes());
                buf.extend_from_slice(&jr.dev_nonce.0.to_le_bytes());
            }
            MacPayload::JoinAccept(ja) => {
                buf.extend_from_slice(&ja.app_nonce.0);
                buf.extend_from_slice(&ja.net_id.to_le_bytes());
                buf.extend_from_slice(&ja.dev_addr.to_le_bytes());
                buf.push(
                    ((ja.dl_settings.rx1_dr_offset & 0x07) << 4)
                        | (ja.dl_settings.rx2_data_rate & 0x0f),
                );
                buf.push(ja.rx_delay & 0x0f);
                if !ja.cf_list.is_empty() {
                    let mut cf_list = [0u8; 16];
                    for (i, freq) in ja.cf_list.iter().take(5).enumerate() {
                        let units = (freq / 100).to_le_bytes();
                        cf_list[i * 3..i * 3 + 3].copy_from_slice(&units[..3]);
                    }
                    buf.extend_from_slice(&cf_list);
                }
            }
            MacPayload::Raw(raw) => buf.extend_from_slice(raw),
        }
        Ok(buf)
    }

    /// Bytes covered by the MIC: MHDR followed by the MAC payload
    pub fn signed_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = vec![self.mhdr.to_byte()];
        buf.extend(self.mac_payload_bytes()?);
        Ok(buf)
    }

    /// Serialize the frame as-is (no encryption applied)
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = self.signed_bytes()?;
        buf.extend_from_slice(&self.mic);
        Ok(buf)
    }
}

fn parse_join_request(body: &[u8]) -> Result<JoinRequestPayload, DecodeError> {
    if body.len() != JOIN_REQUEST_SIZE {
        return Err(DecodeError::InvalidLength {
            what: "join-request",
            expected: JOIN_REQUEST_SIZE,
            actual: body.len(),
        });
    }
    let mut app_eui = [0u8; 8];
    app_eui.copy_from_slice(&body[0..8]);
    let mut dev_eui = [0u8; 8];
    dev_eui.copy_from_slice(&body[8..16]);
    Ok(JoinRequestPayload {
        app_eui: Eui64::from_le_bytes(app_eui),
        dev_eui: Eui64::from_le_bytes(dev_eui),
        dev_nonce: DevNonce(u16::from_le_bytes([body[16], body[17]])),
    })
}

fn parse_join_accept(body: &[u8]) -> Result<JoinAcceptPayload, DecodeError> {
    if body.len() != 12 && body.len() != 28 {
        return Err(DecodeError::InvalidLength {
            what: "join-accept",
            expected: 12,
            actual: body.len(),
        });
    }
    let mut net_id = [0u8; 3];
    net_id.copy_from_slice(&body[3..6]);
    let mut dev_addr = [0u8; 4];
    dev_addr.copy_from_slice(&body[6..10]);

    let cf_list = if body.len() == 28 {
        body[12..27]
            .chunks(3)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], 0]) * 100)
            .filter(|freq| *freq != 0)
            .collect()
    } else {
        Vec::new()
    };

    Ok(JoinAcceptPayload {
        app_nonce: AppNonce([body[0], body[1], body[2]]),
        net_id: NetId::from_le_bytes(net_id),
        dev_addr: DevAddr::from_le_bytes(dev_addr),
        dl_settings: DlSettings {
            rx1_dr_offset: (body[10] >> 4) & 0x07,
            rx2_data_rate: body[10] & 0x0f,
        },
        rx_delay: body[11] & 0x0f,
        cf_list,
    })
}

fn parse_data(body: &[u8]) -> Result<DataPayload, DecodeError> {
    if body.len() < 7 {
        return Err(DecodeError::BufferTooShort {
            needed: 7,
            available: body.len(),
        });
    }
    let dev_addr = DevAddr::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let (f_ctrl, f_opts_len) = FCtrl::from_byte(body[4]);
    let f_cnt = u16::from_le_bytes([body[5], body[6]]);

    let opts_end = 7 + f_opts_len;
    if body.len() < opts_end {
        return Err(DecodeError::BufferTooShort {
            needed: opts_end,
            available: body.len(),
        });
    }
    let f_opts = body[7..opts_end].to_vec();

    let (f_port, frm_payload) = match body.get(opts_end) {
        Some(port) => (Some(*port), body[opts_end + 1..].to_vec()),
        None => (None, Vec::new()),
    };

    Ok(DataPayload {
        fhdr: Fhdr {
            dev_addr,
            f_ctrl,
            f_cnt,
            f_opts,
        },
        f_port,
        frm_payload,
    })
}

/// Expand a 16-bit over-the-air counter to 32 bits.
///
/// `next_expected` is the stored counter (last accepted + 1). Forward
/// jumps below [`MAX_FCNT_GAP`] may cross a 16-bit rollover; anything else
/// is taken as a frame from behind.
pub fn expand_fcnt(next_expected: u32, received: u16) -> u32 {
    let forward = received.wrapping_sub(next_expected as u16);
    if u32::from(forward) < MAX_FCNT_GAP {
        next_expected.wrapping_add(u32::from(forward))
    } else {
        let backward = (next_expected as u16).wrapping_sub(received);
        next_expected.saturating_sub(u32::from(backward))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uplink_bytes() -> Vec<u8> {
        vec![
            0x40, // UnconfirmedDataUp
            0x04, 0x03, 0x02, 0x01, // DevAddr 01020304
            0xa2, // ADR + ACK + 2 bytes FOpts
            0x0a, 0x00, // FCnt 10
            0x02, 0x06, // FOpts: LinkCheckReq, DevStatusAns (partial)
            0x05, // FPort
            0xde, 0xad, // FRMPayload
            0x11, 0x22, 0x33, 0x44, // MIC
        ]
    }

    #[test]
    fn test_parse_data_uplink() {
        let frame = PhyPayload::from_bytes(&uplink_bytes()).unwrap();
        assert_eq!(frame.mhdr.mtype, MType::UnconfirmedDataUp);
        assert_eq!(frame.mic, [0x11, 0x22, 0x33, 0x44]);

        let data = frame.data().unwrap();
        assert_eq!(data.fhdr.dev_addr, DevAddr([1, 2, 3, 4]));
        assert!(data.fhdr.f_ctrl.adr);
        assert!(data.fhdr.f_ctrl.ack);
        assert!(!data.fhdr.f_ctrl.adr_ack_req);
        assert_eq!(data.fhdr.f_cnt, 10);
        assert_eq!(data.fhdr.f_opts, vec![0x02, 0x06]);
        assert_eq!(data.f_port, Some(5));
        assert_eq!(data.frm_payload, vec![0xde, 0xad]);
    }

    #[test]
    fn test_data_frame_bytes_match_input() {
        let bytes = uplink_bytes();
        let frame = PhyPayload::from_bytes(&bytes).unwrap();
        assert_eq!(frame.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_parse_without_port() {
        let bytes = [0x40, 0x04, 0x03, 0x02, 0x01, 0x00, 0x01, 0x00, 0, 0, 0, 0];
        let frame = PhyPayload::from_bytes(&bytes).unwrap();
        let data = frame.data().unwrap();
        assert_eq!(data.f_port, None);
        assert!(data.frm_payload.is_empty());
    }

    #[test]
    fn test_too_short() {
        let result = PhyPayload::from_bytes(&[0x40, 0x01, 0x02]);
        assert!(matches!(
            result,
            Err(DecodeError::BufferTooShort { needed: 5, .. })
        ));
    }

    #[test]
    fn test_truncated_fopts() {
        // FOptsLen = 5 but only 1 byte follows
        let bytes = [0x40, 0x04, 0x03, 0x02, 0x01, 0x05, 0x01, 0x00, 0x02, 0, 0, 0, 0];
        assert!(matches!(
            PhyPayload::from_bytes(&bytes),
            Err(DecodeError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_unsupported_major() {
        let bytes = [0x41, 0x04, 0x03, 0x02, 0x01, 0x00, 0x01, 0x00, 0, 0, 0, 0];
        assert_eq!(
            PhyPayload::from_bytes(&bytes),
            Err(DecodeError::UnsupportedMajor(1))
        );
    }

    #[test]
    fn test_join_request_layout() {
        let jr = JoinRequestPayload {
            app_eui: Eui64([1, 2, 3, 4, 5, 6, 7, 8]),
            dev_eui: Eui64([8, 7, 6, 5, 4, 3, 2, 1]),
            dev_nonce: DevNonce(0x0102),
        };
        let frame = PhyPayload::new(MType::JoinRequest, MacPayload::JoinRequest(jr));
        let bytes = frame.to_bytes().unwrap();

        assert_eq!(bytes.len(), 1 + JOIN_REQUEST_SIZE + MIC_SIZE);
        assert_eq!(bytes[0], 0x00);
        assert_eq!(&bytes[1..9], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[17..19], &[0x02, 0x01]);

        let parsed = PhyPayload::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.mac_payload, MacPayload::JoinRequest(jr));
    }

    #[test]
    fn test_join_request_wrong_length() {
        let bytes = [0x00; 1 + 10 + MIC_SIZE];
        assert!(matches!(
            PhyPayload::from_bytes(&bytes),
            Err(DecodeError::InvalidLength {
                what: "join-request",
                ..
            })
        ));
    }

    #[test]
    fn test_join_accept_cf_list() {
        let ja = JoinAcceptPayload {
            app_nonce: AppNonce([1, 2, 3]),
            net_id: NetId([0, 0, 0x13]),
            dev_addr: DevAddr([0x26, 0x01, 0x02, 0x03]),
            dl_settings: DlSettings {
                rx1_dr_offset: 2,
                rx2_data_rate: 3,
            },
            rx_delay: 1,
            cf_list: vec![867_100_000, 867_300_000],
        };
        let frame = PhyPayload::new(MType::JoinAccept, MacPayload::JoinAccept(ja.clone()));
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes.len(), 1 + 28 + MIC_SIZE);
        assert_eq!(bytes[11], 0x23);

        let parsed = PhyPayload::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.mac_payload, MacPayload::JoinAccept(ja));
    }

    #[test]
    fn test_port_required_for_payload() {
        let frame = PhyPayload::new(
            MType::UnconfirmedDataDown,
            MacPayload::Data(DataPayload {
                frm_payload: vec![1],
                ..Default::default()
            }),
        );
        assert_eq!(frame.to_bytes(), Err(EncodeError::MissingPort));
    }

    #[test]
    fn test_identifier_parse_and_display() {
        let eui: Eui64 = "0102030405060708".parse().unwrap();
        assert_eq!(eui, Eui64([1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(eui.to_string(), "0102030405060708");
        assert!("01020304".parse::<Eui64>().is_err());
        assert!("zz02030405060708".parse::<Eui64>().is_err());

        let json = serde_json::to_string(&eui).unwrap();
        assert_eq!(json, "\"0102030405060708\"");
        let back: Eui64 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, eui);
    }

    #[test]
    fn test_random_dev_addr_prefix() {
        let net_id = NetId([0x00, 0x00, 0x13]);
        for _ in 0..32 {
            assert_eq!(DevAddr::random(net_id).nwk_id(), 0x13);
        }
    }

    #[test]
    fn test_expand_fcnt() {
        assert_eq!(expand_fcnt(0, 0), 0);
        assert_eq!(expand_fcnt(5, 7), 7);
        assert_eq!(expand_fcnt(5, 3), 3);
        assert_eq!(expand_fcnt(65_535, 1), 65_537);
        assert_eq!(expand_fcnt(70_000, 4_465), 70_001);
        // Device reset: counter restarts from zero
        assert_eq!(expand_fcnt(100, 0), 0);
    }
}
