// loraflow - LoRaWAN network-server pipeline
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Storage collaborator
//!
//! The pipeline issues storage calls without any external locking; a
//! [`Storage`] implementation serializes conflicting writes itself. The
//! read-modify-write operations the pipeline relies on (counter advance,
//! nonce append) are therefore part of the trait rather than built from
//! `get` + `update` in the stages.
//!
//! [`MemoryStore`] keeps everything in memory and can optionally mirror its
//! tables to a JSON snapshot file so that a rebuilt pipeline sees the same
//! state.

use crate::error::StorageError;
use crate::model::{Application, Device, DownstreamMessage, UpstreamMessage};
use crate::protocol::{DevAddr, DevNonce, Eui64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Result alias for storage calls
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Persistent state shared by every pipeline stage
pub trait Storage: Send + Sync {
    // Devices

    fn create_device(&self, device: Device) -> StorageResult<()>;
    fn get_device(&self, dev_eui: &Eui64) -> StorageResult<Device>;
    fn update_device(&self, device: &Device) -> StorageResult<()>;
    fn delete_device(&self, dev_eui: &Eui64) -> StorageResult<()>;
    /// Every device registered under an address (addresses are not unique)
    fn get_devices_by_addr(&self, dev_addr: &DevAddr) -> StorageResult<Vec<Device>>;

    /// Append a consumed join nonce, keeping at most `history` entries.
    /// Returns `AlreadyExists` if the nonce is already recorded.
    fn add_dev_nonce(&self, dev_eui: &Eui64, nonce: DevNonce, history: usize)
        -> StorageResult<()>;

    /// Advance the uplink counter to `received + 1` if `received` is not
    /// behind it. Returns the stored value afterwards.
    fn advance_fcnt_up(&self, dev_eui: &Eui64, received: u32) -> StorageResult<u32>;

    /// Increment the downlink counter, returning the new value
    fn increment_fcnt_down(&self, dev_eui: &Eui64) -> StorageResult<u32>;

    /// Reset both frame counters to zero
    fn reset_frame_counters(&self, dev_eui: &Eui64) -> StorageResult<()>;

    fn set_duplicate_key_warning(&self, dev_eui: &Eui64, warning: bool) -> StorageResult<()>;

    // Applications

    fn create_application(&self, application: Application) -> StorageResult<()>;
    fn get_application(&self, app_eui: &Eui64) -> StorageResult<Application>;
    fn delete_application(&self, app_eui: &Eui64) -> StorageResult<()>;

    // Uplinks

    /// Write-once per (device, time)
    fn create_upstream(&self, message: UpstreamMessage) -> StorageResult<()>;
    /// Stored uplinks of a device, oldest first
    fn upstream_messages(&self, dev_eui: &Eui64) -> StorageResult<Vec<UpstreamMessage>>;

    // Downlinks (at most one per device)

    /// Refused with `Conflict` while an incomplete message exists
    fn create_downstream(&self, message: DownstreamMessage) -> StorageResult<()>;
    fn get_downstream(&self, dev_eui: &Eui64) -> StorageResult<DownstreamMessage>;
    /// Replace the stored message; `NotFound` unless `created_at` matches
    fn update_downstream(&self, message: &DownstreamMessage) -> StorageResult<()>;
    fn delete_downstream(&self, dev_eui: &Eui64) -> StorageResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    devices: BTreeMap<Eui64, Device>,
    applications: BTreeMap<Eui64, Application>,
    upstream: BTreeMap<Eui64, BTreeMap<DateTime<Utc>, UpstreamMessage>>,
    downstream: BTreeMap<Eui64, DownstreamMessage>,
}

impl Tables {
    fn device_mut(&mut self, dev_eui: &Eui64) -> StorageResult<&mut Device> {
        self.devices
            .get_mut(dev_eui)
            .ok_or_else(|| StorageError::not_found("device", dev_eui))
    }
}

/// In-memory [`Storage`] with an optional JSON snapshot
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Volatile store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by a snapshot file, loaded if it already exists
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| StorageError::Backend(format!("{}: {}", path.display(), e)))?;
            serde_json::from_str(&raw)
                .map_err(|e| StorageError::Backend(format!("{}: {}", path.display(), e)))?
        } else {
            Tables::default()
        };
        debug!("Opened store at {}", path.display());
        Ok(Self {
            tables: Mutex::new(tables),
            path: Some(path),
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("store lock poisoned".into()))
    }

    /// Run a mutation and persist the result
    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> StorageResult<T>) -> StorageResult<T> {
        let mut tables = self.lock()?;
        let out = f(&mut tables)?;
        self.persist(&tables)?;
        Ok(out)
    }

    fn persist(&self, tables: &Tables) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json =
            serde_json::to_vec_pretty(tables).map_err(|e| StorageError::Backend(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|e| StorageError::Backend(format!("{}: {}", path.display(), e)))
    }
}

impl Storage for MemoryStore {
    fn create_device(&self, device: Device) -> StorageResult<()> {
        self.write(|t| {
            if t.devices.contains_key(&device.dev_eui) {
                return Err(StorageError::already_exists("device", device.dev_eui));
            }
            t.devices.insert(device.dev_eui, device);
            Ok(())
        })
    }

    fn get_device(&self, dev_eui: &Eui64) -> StorageResult<Device> {
        self.lock()?
            .devices
            .get(dev_eui)
            .cloned()
            .ok_or_else(|| StorageError::not_found("device", dev_eui))
    }

    fn update_device(&self, device: &Device) -> StorageResult<()> {
        self.write(|t| {
            *t.device_mut(&device.dev_eui)? = device.clone();
            Ok(())
        })
    }

    fn delete_device(&self, dev_eui: &Eui64) -> StorageResult<()> {
        self.write(|t| {
            t.devices
                .remove(dev_eui)
                .map(|_| ())
                .ok_or_else(|| StorageError::not_found("device", dev_eui))
        })
    }

    fn get_devices_by_addr(&self, dev_addr: &DevAddr) -> StorageResult<Vec<Device>> {
        Ok(self
            .lock()?
            .devices
            .values()
            .filter(|d| d.dev_addr.as_ref() == Some(dev_addr))
            .cloned()
            .collect())
    }

    fn add_dev_nonce(
        &self,
        dev_eui: &Eui64,
        nonce: DevNonce,
        history: usize,
    ) -> StorageResult<()> {
        self.write(|t| {
            let device = t.device_mut(dev_eui)?;
            if device.has_used_nonce(nonce) {
                return Err(StorageError::already_exists("dev nonce", nonce));
            }
            device.record_nonce(nonce, history);
            Ok(())
        })
    }

    fn advance_fcnt_up(&self, dev_eui: &Eui64, received: u32) -> StorageResult<u32> {
        self.write(|t| {
            let device = t.device_mut(dev_eui)?;
            if received >= device.fcnt_up {
                device.fcnt_up = received.saturating_add(1);
            }
            Ok(device.fcnt_up)
        })
    }

    fn increment_fcnt_down(&self, dev_eui: &Eui64) -> StorageResult<u32> {
        self.write(|t| {
            let device = t.device_mut(dev_eui)?;
            device.fcnt_down = device.fcnt_down.wrapping_add(1);
            Ok(device.fcnt_down)
        })
    }

    fn reset_frame_counters(&self, dev_eui: &Eui64) -> StorageResult<()> {
        self.write(|t| {
            t.device_mut(dev_eui)?.reset_frame_counters();
            Ok(())
        })
    }

    fn set_duplicate_key_warning(&self, dev_eui: &Eui64, warning: bool) -> StorageResult<()> {
        self.write(|t| {
            t.device_mut(dev_eui)?.duplicate_key_warning = warning;
            Ok(())
        })
    }

    fn create_application(&self, application: Application) -> StorageResult<()> {
        self.write(|t| {
            if t.applications.contains_key(&application.app_eui) {
                return Err(StorageError::already_exists(
                    "application",
                    application.app_eui,
                ));
            }
            t.applications.insert(application.app_eui, application);
            Ok(())
        })
    }

    fn get_application(&self, app_eui: &Eui64) -> StorageResult<Application> {
        self.lock()?
            .applications
            .get(app_eui)
            .cloned()
            .ok_or_else(|| StorageError::not_found("application", app_eui))
    }

    fn delete_application(&self, app_eui: &Eui64) -> StorageResult<()> {
        self.write(|t| {
            t.applications
                .remove(app_eui)
                .map(|_| ())
                .ok_or_else(|| StorageError::not_found("application", app_eui))
        })
    }

    fn create_upstream(&self, message: UpstreamMessage) -> StorageResult<()> {
        self.write(|t| {
            let per_device = t.upstream.entry(message.dev_eui).or_default();
            if per_device.contains_key(&message.time) {
                return Err(StorageError::already_exists(
                    "upstream message",
                    format!("{}@{}", message.dev_eui, message.time),
                ));
            }
            per_device.insert(message.time, message);
            Ok(())
        })
    }

    fn upstream_messages(&self, dev_eui: &Eui64) -> StorageResult<Vec<UpstreamMessage>> {
        Ok(self
            .lock()?
            .upstream
            .get(dev_eui)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn create_downstream(&self, message: DownstreamMessage) -> StorageResult<()> {
        self.write(|t| {
            if let Some(existing) = t.downstream.get(&message.dev_eui) {
                if !existing.is_complete() {
                    return Err(StorageError::Conflict(format!(
                        "device {} already has a pending downstream message",
                        message.dev_eui
                    )));
                }
            }
            t.downstream.insert(message.dev_eui, message);
            Ok(())
        })
    }

    fn get_downstream(&self, dev_eui: &Eui64) -> StorageResult<DownstreamMessage> {
        self.lock()?
            .downstream
            .get(dev_eui)
            .cloned()
            .ok_or_else(|| StorageError::not_found("downstream message", dev_eui))
    }

    fn update_downstream(&self, message: &DownstreamMessage) -> StorageResult<()> {
        self.write(|t| match t.downstream.get_mut(&message.dev_eui) {
            Some(stored) if stored.created_at == message.created_at => {
                *stored = message.clone();
                Ok(())
            }
            _ => Err(StorageError::not_found(
                "downstream message",
                format!("{}@{}", message.dev_eui, message.created_at),
            )),
        })
    }

    fn delete_downstream(&self, dev_eui: &Eui64) -> StorageResult<()> {
        self.write(|t| {
            t.downstream
                .remove(dev_eui)
                .map(|_| ())
                .ok_or_else(|| StorageError::not_found("downstream message", dev_eui))
        })
    }
}
