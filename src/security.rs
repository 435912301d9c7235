// loraflow - LoRaWAN network-server pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! LoRaWAN 1.0 security primitives
//!
//! Provides the cryptographic side of the frame codec:
//! - AES-CMAC message integrity codes (data, join request, join accept)
//! - FRMPayload encryption / decryption
//! - OTAA session-key derivation
//! - Join-accept encryption
//!
//! ```text
//! B0  = [0x49] [0x00 x4] [dir] [DevAddr LE] [FCnt LE 32] [0x00] [len(msg)]
//! Ai  = [0x01] [0x00 x4] [dir] [DevAddr LE] [FCnt LE 32] [0x00] [i]
//! Key = aes128_encrypt(AppKey, [0x01|0x02] [AppNonce] [NetID] [DevNonce] [pad])
//! ```

use crate::error::{CryptoError, LoraError};
use crate::protocol::{
    hex_identifier, AppNonce, DevAddr, DevNonce, MType, MacPayload, NetId, PhyPayload, MIC_SIZE,
};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

hex_identifier!(
    /// 128-bit AES key (AppKey, AppSKey, NwkSKey)
    Aes128Key,
    16
);

/// Link direction, as used in the B0 and Ai blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink,
    Downlink,
}

impl Direction {
    /// Direction of a frame of the given type
    pub fn of(mtype: MType) -> Self {
        if mtype.is_uplink() {
            Direction::Uplink
        } else {
            Direction::Downlink
        }
    }

    fn byte(self) -> u8 {
        match self {
            Direction::Uplink => 0x00,
            Direction::Downlink => 0x01,
        }
    }
}

/// Session keys produced by an OTAA join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    pub nwk_s_key: Aes128Key,
    pub app_s_key: Aes128Key,
}

fn cipher(key: &Aes128Key) -> Aes128 {
    Aes128::new(GenericArray::from_slice(&key.0))
}

fn encrypt_block(key: &Aes128Key, block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut buf = GenericArray::from(block);
    cipher(key).encrypt_block(&mut buf);
    buf.into()
}

fn cmac(key: &Aes128Key, parts: &[&[u8]]) -> [u8; BLOCK_SIZE] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(&key.0));
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn truncate_mic(full: [u8; BLOCK_SIZE]) -> [u8; MIC_SIZE] {
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&full[..MIC_SIZE]);
    mic
}

fn counter_block(prefix: u8, dir: Direction, dev_addr: &DevAddr, fcnt: u32, last: u8) -> [u8; 16] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = prefix;
    block[5] = dir.byte();
    block[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    block[10..14].copy_from_slice(&fcnt.to_le_bytes());
    block[15] = last;
    block
}

/// MIC of a data frame. `msg` is MHDR through FRMPayload.
pub fn data_mic(
    key: &Aes128Key,
    dir: Direction,
    dev_addr: &DevAddr,
    fcnt: u32,
    msg: &[u8],
) -> [u8; MIC_SIZE] {
    let b0 = counter_block(0x49, dir, dev_addr, fcnt, msg.len() as u8);
    truncate_mic(cmac(key, &[&b0, msg]))
}

/// MIC of a join request or join accept, keyed with the AppKey
pub fn join_mic(app_key: &Aes128Key, msg: &[u8]) -> [u8; MIC_SIZE] {
    truncate_mic(cmac(app_key, &[msg]))
}

/// Encrypt or decrypt an FRMPayload in place (the operation is symmetric)
pub fn crypt_frm_payload(
    key: &Aes128Key,
    dir: Direction,
    dev_addr: &DevAddr,
    fcnt: u32,
    payload: &mut [u8],
) {
    for (i, chunk) in payload.chunks_mut(BLOCK_SIZE).enumerate() {
        let a = counter_block(0x01, dir, dev_addr, fcnt, (i + 1) as u8);
        let s = encrypt_block(key, a);
        for (byte, k) in chunk.iter_mut().zip(s.iter()) {
            *byte ^= k;
        }
    }
}

fn key_block(prefix: u8, app_nonce: AppNonce, net_id: NetId, dev_nonce: DevNonce) -> [u8; 16] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = prefix;
    block[1..4].copy_from_slice(&app_nonce.0);
    block[4..7].copy_from_slice(&net_id.to_le_bytes());
    block[7..9].copy_from_slice(&dev_nonce.0.to_le_bytes());
    block
}

fn derive_key(
    prefix: u8,
    app_key: &Aes128Key,
    app_nonce: AppNonce,
    net_id: NetId,
    dev_nonce: DevNonce,
) -> Aes128Key {
    Aes128Key(encrypt_block(
        app_key,
        key_block(prefix, app_nonce, net_id, dev_nonce),
    ))
}

/// Derive NwkSKey and AppSKey for an OTAA join
pub fn derive_session_keys(
    app_key: &Aes128Key,
    app_nonce: AppNonce,
    net_id: NetId,
    dev_nonce: DevNonce,
) -> SessionKeys {
    SessionKeys {
        nwk_s_key: derive_key(0x01, app_key, app_nonce, net_id, dev_nonce),
        app_s_key: derive_key(0x02, app_key, app_nonce, net_id, dev_nonce),
    }
}

/// Network-side join-accept encryption (AES decrypt, block by block)
pub fn encrypt_join_accept(app_key: &Aes128Key, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidBlockLength(data.len()));
    }
    let aes = cipher(app_key);
    let mut out = data.to_vec();
    for chunk in out.chunks_mut(BLOCK_SIZE) {
        aes.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// Device-side join-accept decryption (AES encrypt, block by block)
pub fn decrypt_join_accept(app_key: &Aes128Key, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidBlockLength(data.len()));
    }
    let aes = cipher(app_key);
    let mut out = data.to_vec();
    for chunk in out.chunks_mut(BLOCK_SIZE) {
        aes.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

impl PhyPayload {
    fn data_frame(&self) -> Result<(DevAddr, Option<u8>), CryptoError> {
        match &self.mac_payload {
            MacPayload::Data(data) => Ok((data.fhdr.dev_addr, data.f_port)),
            _ => Err(CryptoError::WrongFrameType(self.mhdr.mtype)),
        }
    }

    /// Compute the MIC of a data frame for the full 32-bit counter
    pub fn compute_data_mic(&self, nwk_s_key: &Aes128Key, fcnt: u32) -> Result<[u8; 4], LoraError> {
        let (dev_addr, _) = self.data_frame()?;
        let msg = self.signed_bytes()?;
        Ok(data_mic(
            nwk_s_key,
            Direction::of(self.mhdr.mtype),
            &dev_addr,
            fcnt,
            &msg,
        ))
    }

    /// Sign a data frame
    pub fn set_data_mic(&mut self, nwk_s_key: &Aes128Key, fcnt: u32) -> Result<(), LoraError> {
        self.mic = self.compute_data_mic(nwk_s_key, fcnt)?;
        Ok(())
    }

    /// Check the MIC of a data frame
    pub fn validate_data_mic(&self, nwk_s_key: &Aes128Key, fcnt: u32) -> Result<bool, LoraError> {
        Ok(self.compute_data_mic(nwk_s_key, fcnt)? == self.mic)
    }

    /// Encrypt or decrypt the FRMPayload in place.
    ///
    /// Port 0 payloads use the NwkSKey, application ports the AppSKey.
    pub fn crypt_frm_payload(&mut self, keys: &SessionKeys, fcnt: u32) -> Result<(), LoraError> {
        let dir = Direction::of(self.mhdr.mtype);
        let (dev_addr, f_port) = self.data_frame()?;
        let key = match f_port {
            Some(0) => &keys.nwk_s_key,
            _ => &keys.app_s_key,
        };
        if let MacPayload::Data(data) = &mut self.mac_payload {
            crypt_frm_payload(key, dir, &dev_addr, fcnt, &mut data.frm_payload);
        }
        Ok(())
    }

    fn check_join(&self) -> Result<(), CryptoError> {
        match self.mac_payload {
            MacPayload::JoinRequest(_) | MacPayload::JoinAccept(_) => Ok(()),
            _ => Err(CryptoError::WrongFrameType(self.mhdr.mtype)),
        }
    }

    /// Sign a join request or join accept
    pub fn set_join_mic(&mut self, app_key: &Aes128Key) -> Result<(), LoraError> {
        self.check_join()?;
        self.mic = join_mic(app_key, &self.signed_bytes()?);
        Ok(())
    }

    /// Check the MIC of a join request or join accept
    pub fn validate_join_mic(&self, app_key: &Aes128Key) -> Result<bool, LoraError> {
        self.check_join()?;
        Ok(join_mic(app_key, &self.signed_bytes()?) == self.mic)
    }

    /// Serialize a signed join accept, encrypting everything after the MHDR
    pub fn encrypt_join_accept(&self, app_key: &Aes128Key) -> Result<Vec<u8>, LoraError> {
        if !matches!(self.mac_payload, MacPayload::JoinAccept(_)) {
            return Err(CryptoError::WrongFrameType(self.mhdr.mtype).into());
        }
        let plain = self.to_bytes()?;
        let mut out = vec![plain[0]];
        out.extend(encrypt_join_accept(app_key, &plain[1..])?);
        Ok(out)
    }

    /// Decrypt a join accept taken off the air and verify its MIC
    pub fn decrypt_join_accept(bytes: &[u8], app_key: &Aes128Key) -> Result<Self, LoraError> {
        let Some((mhdr, body)) = bytes.split_first() else {
            return Err(CryptoError::InvalidBlockLength(0).into());
        };
        let mut plain = vec![*mhdr];
        plain.extend(decrypt_join_accept(app_key, body)?);
        let frame = PhyPayload::from_bytes(&plain)?;
        if !frame.validate_join_mic(app_key)? {
            return Err(CryptoError::MicMismatch.into());
        }
        Ok(frame)
    }
}
