//! Shared helpers for integration tests: a simulated end device and a
//! running pipeline over an in-memory store.

#![allow(dead_code)]

use loraflow::protocol::{
    DataPayload, FCtrl, Fhdr, JoinAcceptPayload, JoinRequestPayload, MacPayload,
};
use loraflow::security::derive_session_keys;
use loraflow::*;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const APP_EUI: Eui64 = Eui64([0x70, 0xb3, 0xd5, 0x7e, 0xd0, 0x00, 0x00, 0x01]);
pub const GATEWAY_EUI: Eui64 = Eui64([0xb8, 0x27, 0xeb, 0xff, 0xfe, 0x00, 0x00, 0x01]);

/// Time to wait for a downlink that should come
pub const EXPECT_DOWNLINK: Duration = Duration::from_secs(3);
/// Time to wait before concluding no downlink comes
pub const EXPECT_SILENCE: Duration = Duration::from_millis(600);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An end device, holding its own copy of keys and counters
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub dev_eui: Eui64,
    pub dev_addr: DevAddr,
    pub app_key: Aes128Key,
    pub keys: SessionKeys,
    pub fcnt_up: u32,
    pub relax_fcnt: bool,
}

impl SimDevice {
    /// ABP device with keys derived from `seed`
    pub fn abp(seed: u8, dev_addr: DevAddr) -> Self {
        Self {
            dev_eui: Eui64([0x00, 0x04, 0xa3, 0x0b, 0x00, 0x00, 0x00, seed]),
            dev_addr,
            app_key: Aes128Key([seed; 16]),
            keys: SessionKeys {
                nwk_s_key: Aes128Key([seed.wrapping_add(0x10); 16]),
                app_s_key: Aes128Key([seed.wrapping_add(0x20); 16]),
            },
            fcnt_up: 1,
            relax_fcnt: false,
        }
    }

    /// OTAA device, not yet joined
    pub fn otaa(seed: u8) -> Self {
        let mut sim = Self::abp(seed, DevAddr::default());
        sim.keys = SessionKeys {
            nwk_s_key: Aes128Key::default(),
            app_s_key: Aes128Key::default(),
        };
        sim
    }

    pub fn relaxed(mut self) -> Self {
        self.relax_fcnt = true;
        self
    }

    /// Record to provision in storage
    pub fn abp_record(&self) -> Device {
        let device = Device::abp(
            self.dev_eui,
            APP_EUI,
            self.dev_addr,
            self.keys.nwk_s_key,
            self.keys.app_s_key,
        );
        if self.relax_fcnt {
            device.with_relaxed_fcnt()
        } else {
            device
        }
    }

    pub fn otaa_record(&self) -> Device {
        Device::otaa(self.dev_eui, APP_EUI, self.app_key)
    }

    /// Next uplink, advancing the device counter
    pub fn uplink(&mut self, mtype: MType, f_port: u8, payload: &[u8], ack: bool) -> Vec<u8> {
        let bytes = self.uplink_with_fcnt(mtype, self.fcnt_up, f_port, payload, ack);
        self.fcnt_up += 1;
        bytes
    }

    /// Uplink with an explicit counter
    pub fn uplink_with_fcnt(
        &self,
        mtype: MType,
        fcnt: u32,
        f_port: u8,
        payload: &[u8],
        ack: bool,
    ) -> Vec<u8> {
        let mut frame = PhyPayload::new(
            mtype,
            MacPayload::Data(DataPayload {
                fhdr: Fhdr {
                    dev_addr: self.dev_addr,
                    f_ctrl: FCtrl {
                        ack,
                        ..Default::default()
                    },
                    f_cnt: fcnt as u16,
                    f_opts: Vec::new(),
                },
                f_port: Some(f_port),
                frm_payload: payload.to_vec(),
            }),
        );
        frame.crypt_frm_payload(&self.keys, fcnt).unwrap();
        frame.set_data_mic(&self.keys.nwk_s_key, fcnt).unwrap();
        frame.to_bytes().unwrap()
    }

    pub fn join_request(&self, dev_nonce: u16) -> Vec<u8> {
        let mut frame = PhyPayload::new(
            MType::JoinRequest,
            MacPayload::JoinRequest(JoinRequestPayload {
                app_eui: APP_EUI,
                dev_eui: self.dev_eui,
                dev_nonce: DevNonce(dev_nonce),
            }),
        );
        frame.set_join_mic(&self.app_key).unwrap();
        frame.to_bytes().unwrap()
    }

    /// Process a join accept the way the device would
    pub fn accept_join(&mut self, bytes: &[u8], dev_nonce: u16) -> JoinAcceptPayload {
        let frame = PhyPayload::decrypt_join_accept(bytes, &self.app_key).unwrap();
        let accept = match frame.mac_payload {
            MacPayload::JoinAccept(accept) => accept,
            other => panic!("not a join accept: {:?}", other),
        };
        self.keys = derive_session_keys(
            &self.app_key,
            accept.app_nonce,
            accept.net_id,
            DevNonce(dev_nonce),
        );
        self.dev_addr = accept.dev_addr;
        self.fcnt_up = 0;
        accept
    }

    /// Verify and decrypt a data downlink addressed to this device
    pub fn open_downlink(&self, bytes: &[u8]) -> PhyPayload {
        let mut frame = PhyPayload::from_bytes(bytes).unwrap();
        let data = frame.data().expect("data downlink");
        assert_eq!(data.fhdr.dev_addr, self.dev_addr);
        let fcnt = u32::from(data.fhdr.f_cnt);
        assert!(
            frame.validate_data_mic(&self.keys.nwk_s_key, fcnt).unwrap(),
            "downlink MIC does not verify"
        );
        frame.crypt_frm_payload(&self.keys, fcnt).unwrap();
        frame
    }
}

/// Wrap bytes as received by the test gateway
pub fn rx(bytes: Vec<u8>) -> RxPacket {
    RxPacket::new(bytes, RxInfo::new(GATEWAY_EUI))
}

/// Running pipeline plus the store it works on
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub handle: PipelineHandle,
    pub publisher: BroadcastPublisher,
}

impl Harness {
    pub fn config() -> PipelineConfig {
        PipelineConfig::with_collect_window(Duration::from_millis(100))
    }

    /// Fresh store with the test application
    pub fn new_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .create_application(Application::new(APP_EUI, "integration"))
            .unwrap();
        store
    }

    pub fn start(store: Arc<MemoryStore>) -> Self {
        Self::start_with(store, Self::config())
    }

    pub fn start_with(store: Arc<MemoryStore>, config: PipelineConfig) -> Self {
        init_tracing();
        let publisher = BroadcastPublisher::new(64);
        let handle = Pipeline::new(config, store.clone())
            .with_publisher(Arc::new(publisher.clone()))
            .start()
            .unwrap();
        Self {
            store,
            handle,
            publisher,
        }
    }

    pub async fn send(&self, bytes: Vec<u8>) {
        self.handle.send(rx(bytes)).await.unwrap();
    }

    pub async fn expect_downlink(&mut self) -> TxPacket {
        self.handle
            .recv_timeout(EXPECT_DOWNLINK)
            .await
            .expect("expected a downlink")
    }

    pub async fn expect_silence(&mut self) {
        if let Some(packet) = self.handle.recv_timeout(EXPECT_SILENCE).await {
            panic!("unexpected downlink: {:02x?}", packet.phy_payload);
        }
    }

    /// Wait until `event` has been counted `count` times
    pub async fn wait_for(&self, event: PipelineEvent, count: u64) {
        let deadline = tokio::time::Instant::now() + EXPECT_DOWNLINK;
        while self.handle.metrics().get(event) < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} x{}",
                event.as_str(),
                count
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
