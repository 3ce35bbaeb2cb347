//! Cross-process snapshot of stage configuration and live axis state.
//!
//! The owning process serializes a [`SnapshotPayload`] into a fixed-size
//! file-backed memory region; any number of observer processes attach
//! read-only and decode on demand without contacting the stage manager.
//!
//! Region layout:
//!
//! ```text
//! [u32 magic][u64 version][u32 payload length][JSON payload ... up to MAX]
//! ```
//!
//! The version counter is bumped to an odd value before a write and back
//! to even after, so a reader that observes an odd or changing version
//! knows the frame is torn and retries. There is no reader-side locking.
//!
//! Lifecycle: created once per stage session by the owner, attached by
//! readers, and unlinked only by the owner at session end. Readers keep a
//! private mapping, so an already-attached reader survives the unlink;
//! fresh attachments fail with a not-found error.

use crate::axis::{AxisId, AxisRuntimeState, Units};
use crate::config::StageConfiguration;
use crate::error::SnapshotError;
use chrono::{DateTime, Utc};
use memmap2::{Mmap, MmapMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const MAGIC: u32 = 0x5354_4147; // "STAG"
const HEADER_BYTES: usize = 16;
/// Fixed maximum payload size; the region never grows.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024;
const REGION_BYTES: usize = HEADER_BYTES + MAX_PAYLOAD_BYTES;

const MAGIC_RANGE: std::ops::Range<usize> = 0..4;
const VERSION_RANGE: std::ops::Range<usize> = 4..12;
const LENGTH_RANGE: std::ops::Range<usize> = 12..16;

/// Per-axis slice of the snapshot: configured limits plus live runtime
/// state. Field names are stable; consumers must ignore unknown keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSnapshot {
    pub units: Units,
    pub position_limits: (f64, f64),
    pub velocity: f64,
    #[serde(flatten)]
    pub runtime: AxisRuntimeState,
}

/// The full published record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub port: String,
    pub baud_rate: u32,
    pub axes: BTreeMap<AxisId, AxisSnapshot>,
    pub captured_at: DateTime<Utc>,
}

impl SnapshotPayload {
    /// Assemble a payload from the configuration and live runtime states.
    /// Limits come from the runtime view when present (homing-to-limits
    /// rewrites them), falling back to the configured bounds.
    pub fn assemble(
        config: &StageConfiguration,
        states: &BTreeMap<AxisId, (AxisRuntimeState, (f64, f64))>,
    ) -> Self {
        let mut axes = BTreeMap::new();
        for (axis, axis_config) in &config.axes {
            let (runtime, limits) = states
                .get(axis)
                .map(|(state, limits)| (*state, *limits))
                .unwrap_or((
                    AxisRuntimeState {
                        position: 0.0,
                        is_homed: false,
                        move_in_progress: false,
                        target: None,
                        state: crate::axis::DriverState::Disconnected,
                    },
                    axis_config.position_limits,
                ));
            axes.insert(
                *axis,
                AxisSnapshot {
                    units: axis.units(),
                    position_limits: limits,
                    velocity: axis_config.velocity,
                    runtime,
                },
            );
        }
        Self {
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            axes,
            captured_at: Utc::now(),
        }
    }
}

/// Resolve a region name to its backing path: `/dev/shm` where available,
/// otherwise the system temp directory.
pub fn region_path(name: &str) -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.join(name)
    } else {
        std::env::temp_dir().join(name)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Single writer of the shared region. Owns the region file and unlinks
/// it on drop.
pub struct SnapshotPublisher {
    path: PathBuf,
    mmap: MmapMut,
    version: u64,
}

impl SnapshotPublisher {
    /// Create (or truncate) the named region and take ownership of it.
    pub fn create(name: &str) -> Result<Self, SnapshotError> {
        Self::create_at(region_path(name))
    }

    /// Create the region at an explicit path.
    #[allow(unsafe_code)]
    pub fn create_at(path: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(REGION_BYTES as u64)?;
        // Mapping a file we just created and sized; the fd stays valid for
        // the mapping's lifetime.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        mmap[MAGIC_RANGE].copy_from_slice(&MAGIC.to_le_bytes());
        mmap[VERSION_RANGE].copy_from_slice(&0u64.to_le_bytes());
        mmap[LENGTH_RANGE].copy_from_slice(&0u32.to_le_bytes());

        debug!(path = %path.display(), "snapshot region created");
        Ok(Self {
            path,
            mmap,
            version: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Publish a new frame, replacing the previous one wholesale.
    pub fn publish(&mut self, payload: &SnapshotPayload) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec(payload)?;
        if bytes.len() > MAX_PAYLOAD_BYTES {
            return Err(SnapshotError::PayloadTooLarge {
                len: bytes.len(),
                max: MAX_PAYLOAD_BYTES,
            });
        }

        // Odd version marks the frame as in-flux for readers.
        self.version += 1;
        self.mmap[VERSION_RANGE].copy_from_slice(&self.version.to_le_bytes());

        self.mmap[LENGTH_RANGE].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.mmap[HEADER_BYTES..HEADER_BYTES + bytes.len()].copy_from_slice(&bytes);

        self.version += 1;
        self.mmap[VERSION_RANGE].copy_from_slice(&self.version.to_le_bytes());
        Ok(())
    }
}

impl Drop for SnapshotPublisher {
    fn drop(&mut self) {
        // Owner teardown: unlink the region. Attached readers keep their
        // mapping; new attachments will fail.
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "snapshot region unlink failed");
        }
    }
}

/// Read-only attachment to a published region.
pub struct SnapshotReader {
    mmap: Mmap,
}

impl SnapshotReader {
    /// Attach to the named region. Fails if the owner has not created it
    /// (or has already unlinked it).
    pub fn attach(name: &str) -> Result<Self, SnapshotError> {
        Self::attach_at(region_path(name))
    }

    #[allow(unsafe_code)]
    pub fn attach_at(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        // Read-only mapping of the owner's region.
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < HEADER_BYTES || read_u32(&mmap[MAGIC_RANGE]) != MAGIC {
            return Err(SnapshotError::BadMagic {
                path: path.display().to_string(),
            });
        }
        Ok(Self { mmap })
    }

    /// Decode the current frame, retrying while the writer is mid-update.
    pub fn read(&self) -> Result<SnapshotPayload, SnapshotError> {
        const MAX_ATTEMPTS: u32 = 8;

        for _ in 0..MAX_ATTEMPTS {
            let before = read_u64(&self.mmap[VERSION_RANGE]);
            if before % 2 == 1 {
                std::thread::sleep(Duration::from_micros(200));
                continue;
            }
            if before == 0 {
                return Err(SnapshotError::NotPublished);
            }

            let len = read_u32(&self.mmap[LENGTH_RANGE]) as usize;
            if len == 0 || len > MAX_PAYLOAD_BYTES {
                std::thread::sleep(Duration::from_micros(200));
                continue;
            }
            let bytes = self.mmap[HEADER_BYTES..HEADER_BYTES + len].to_vec();

            let after = read_u64(&self.mmap[VERSION_RANGE]);
            if before == after {
                return Ok(serde_json::from_slice(&bytes)?);
            }
        }

        Err(SnapshotError::Torn {
            attempts: MAX_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::DriverState;

    fn sample_payload() -> SnapshotPayload {
        let config = StageConfiguration::default();
        let mut states = BTreeMap::new();
        states.insert(
            AxisId::X,
            (
                AxisRuntimeState {
                    position: 1234.5,
                    is_homed: true,
                    move_in_progress: false,
                    target: None,
                    state: DriverState::Idle,
                },
                (-24_940.0, 20_000.0),
            ),
        );
        SnapshotPayload::assemble(&config, &states)
    }

    #[test]
    fn publish_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let mut publisher = SnapshotPublisher::create_at(&path).unwrap();
        let payload = sample_payload();
        publisher.publish(&payload).unwrap();

        let reader = SnapshotReader::attach_at(&path).unwrap();
        let decoded = reader.read().unwrap();
        assert_eq!(decoded, payload);
        assert!(decoded.axes[&AxisId::X].runtime.is_homed);
        assert_eq!(
            decoded.axes[&AxisId::Y].runtime.state,
            DriverState::Disconnected
        );
    }

    #[test]
    fn unpublished_region_reports_not_published() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let _publisher = SnapshotPublisher::create_at(&path).unwrap();
        let reader = SnapshotReader::attach_at(&path).unwrap();
        assert!(matches!(reader.read(), Err(SnapshotError::NotPublished)));
    }

    #[test]
    fn attach_fails_on_missing_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope");
        assert!(matches!(
            SnapshotReader::attach_at(&path),
            Err(SnapshotError::Io(_))
        ));
    }

    #[test]
    fn attach_rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        std::fs::write(&path, vec![0u8; REGION_BYTES]).unwrap();
        assert!(matches!(
            SnapshotReader::attach_at(&path),
            Err(SnapshotError::BadMagic { .. })
        ));
    }

    #[test]
    fn owner_unlinks_region_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        {
            let mut publisher = SnapshotPublisher::create_at(&path).unwrap();
            publisher.publish(&sample_payload()).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn attached_reader_survives_owner_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let mut publisher = SnapshotPublisher::create_at(&path).unwrap();
        publisher.publish(&sample_payload()).unwrap();
        let reader = SnapshotReader::attach_at(&path).unwrap();
        drop(publisher);
        // The mapping is private to the reader; decoding still works.
        assert!(reader.read().is_ok());
    }
}
