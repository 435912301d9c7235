//! # loraflow - LoRaWAN network-server pipeline
//!
//! Turns raw radio frames received by gateways into verified, decrypted
//! application payloads, and pending application data into correctly timed,
//! correctly encoded downlink frames.
//!
//! ## Key Features
//!
//! - **Five-stage pipeline**: decoder, verifier, MAC processor, scheduler, encoder
//! - **Anti-replay**: MIC authentication, monotonic frame counters, join nonce history
//! - **OTAA joins**: session-key derivation and address assignment
//! - **At most one downlink per device** per receive window
//! - **Crash-safe message state** through the [`Storage`] collaborator
//!
//! ## Quick Start
//!
//! ```rust
//! use loraflow::protocol::{DataPayload, DevAddr, Fhdr, MType, MacPayload, PhyPayload};
//! use loraflow::security::{Aes128Key, SessionKeys};
//!
//! let keys = SessionKeys {
//!     nwk_s_key: Aes128Key([1; 16]),
//!     app_s_key: Aes128Key([2; 16]),
//! };
//!
//! // Build and sign an uplink the way a device would
//! let mut frame = PhyPayload::new(
//!     MType::UnconfirmedDataUp,
//!     MacPayload::Data(DataPayload {
//!         fhdr: Fhdr { dev_addr: DevAddr([0x26, 1, 2, 3]), f_cnt: 1, ..Default::default() },
//!         f_port: Some(10),
//!         frm_payload: b"22.5C".to_vec(),
//!     }),
//! );
//! frame.crypt_frm_payload(&keys, 1).unwrap();
//! frame.set_data_mic(&keys.nwk_s_key, 1).unwrap();
//! let bytes = frame.to_bytes().unwrap();
//!
//! // Network side
//! let mut received = PhyPayload::from_bytes(&bytes).unwrap();
//! assert!(received.validate_data_mic(&keys.nwk_s_key, 1).unwrap());
//! received.crypt_frm_payload(&keys, 1).unwrap();
//! assert_eq!(received.data().unwrap().frm_payload, b"22.5C");
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: LoRaWAN frame structures and wire format
//! - [`security`]: MIC, payload encryption, session-key derivation
//! - [`mac`]: MAC command parsing
//! - [`model`]: Devices, applications, queued messages
//! - [`storage`]: Storage collaborator and in-memory implementation
//! - [`pipeline`]: Stage tasks and coordinator
//! - [`metrics`]: Pipeline counters

// Modules
pub mod config;
pub mod context;
pub mod error;
pub mod mac;
pub mod metrics;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod protocol;
pub mod publish;
pub mod security;
pub mod storage;

// Re-exports for convenient access
pub use config::{JoinSettings, PipelineConfig};
pub use context::{FrameContext, RxInfo, RxPacket, TxInfo, TxPacket};
pub use error::{
    ConfigError, CryptoError, DecodeError, EncodeError, JoinError, LoraError, Result,
    StorageError,
};
pub use metrics::{MetricsSnapshot, PipelineEvent, PipelineMetrics};
pub use model::{Application, Device, DownstreamMessage, DownstreamState, UpstreamMessage};
pub use pipeline::{Pipeline, PipelineHandle};
pub use protocol::{DevAddr, DevNonce, Eui64, MType, NetId, PhyPayload};
pub use publish::{ApplicationPayload, BroadcastPublisher, NullPublisher, Publisher, Subscription};
pub use security::{Aes128Key, SessionKeys};
pub use storage::{MemoryStore, Storage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// LoRaWAN version implemented
pub const LORAWAN_VERSION: &str = "1.0.2";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_reexports() {
        let eui: Eui64 = "0102030405060708".parse().unwrap();
        assert_eq!(eui.to_string(), "0102030405060708");
        assert_eq!(PipelineConfig::default().dev_nonce_history, 10);
    }
}
