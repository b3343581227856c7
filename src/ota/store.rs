//! The upgrade record, kept in its own flash sector so it survives resets.

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};
use thiserror::Error;

use super::layout::FirmwareSlot;
use crate::impl_from_variant;

const UPGRADE_RECORD_MAGIC: u32 = 0x4755_5044;
const RECORD_VERSION: u8 = 1;
const RECORD_LEN: usize = 8;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("Flash access failed: {0:?}")]
    Flash(NorFlashErrorKind),
}
impl_from_variant!(StoreError, Flash, NorFlashErrorKind);

pub type StoreResult<T> = Result<T, StoreError>;

/// Progress of an update, as remembered across resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpgradeFlag {
    #[default]
    Idle,
    Started,
    Finished,
}

impl UpgradeFlag {
    fn as_persisted(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Started => 1,
            Self::Finished => 2,
        }
    }

    fn from_persisted(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Idle),
            1 => Some(Self::Started),
            2 => Some(Self::Finished),
            _ => None,
        }
    }
}

/// The upgrade flag together with the slot it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeRecord {
    pub flag: UpgradeFlag,
    pub slot: FirmwareSlot,
}

impl UpgradeRecord {
    pub const fn new(flag: UpgradeFlag, slot: FirmwareSlot) -> Self {
        Self { flag, slot }
    }
}

impl Default for UpgradeRecord {
    fn default() -> Self {
        Self::new(UpgradeFlag::Idle, FirmwareSlot::B)
    }
}

pub trait UpgradeFlagStore {
    fn load(&mut self) -> StoreResult<UpgradeRecord>;
    fn store(&mut self, record: UpgradeRecord) -> StoreResult<()>;
}

/// One checksummed record at the start of a flash sector.
///
/// Layout: magic (LE u32), format version, two payload bytes, checksum.
struct SectorRecord<F> {
    flash: F,
    offset: u32,
}

impl<F: NorFlash> SectorRecord<F> {
    fn read(&mut self) -> StoreResult<Option<[u8; 2]>> {
        let mut record = [0u8; RECORD_LEN];
        self.flash
            .read(self.offset, &mut record)
            .map_err(|err| err.kind())?;

        if record.iter().all(|&byte| byte == 0xFF) {
            return Ok(None);
        }
        let magic = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        if magic != UPGRADE_RECORD_MAGIC
            || record[4] != RECORD_VERSION
            || record[RECORD_LEN - 1] != checksum8(&record[..RECORD_LEN - 1])
        {
            log::warn!("Ignoring corrupt record at {:#x}", self.offset);
            return Ok(None);
        }
        Ok(Some([record[5], record[6]]))
    }

    fn write(&mut self, payload: [u8; 2]) -> StoreResult<()> {
        let mut record = [0xFFu8; RECORD_LEN];
        record[0..4].copy_from_slice(&UPGRADE_RECORD_MAGIC.to_le_bytes());
        record[4] = RECORD_VERSION;
        record[5..7].copy_from_slice(&payload);
        record[RECORD_LEN - 1] = checksum8(&record[..RECORD_LEN - 1]);

        self.flash
            .erase(self.offset, self.offset + F::ERASE_SIZE as u32)
            .map_err(|err| err.kind())?;
        self.flash
            .write(self.offset, &record)
            .map_err(|err| err.kind())?;
        Ok(())
    }
}

fn checksum8(bytes: &[u8]) -> u8 {
    let mut acc = 0x5Au8;
    for &byte in bytes {
        acc ^= byte.rotate_left(1);
    }
    acc
}

pub struct FlashUpgradeFlag<F> {
    record: SectorRecord<F>,
}

impl<F: NorFlash> FlashUpgradeFlag<F> {
    pub fn new(flash: F, offset: u32) -> Self {
        Self {
            record: SectorRecord { flash, offset },
        }
    }

    pub fn into_inner(self) -> F {
        self.record.flash
    }
}

impl<F: NorFlash> UpgradeFlagStore for FlashUpgradeFlag<F> {
    fn load(&mut self) -> StoreResult<UpgradeRecord> {
        let Some([flag, slot]) = self.record.read()? else {
            return Ok(UpgradeRecord::default());
        };
        match (UpgradeFlag::from_persisted(flag), FirmwareSlot::from_index(slot)) {
            (Some(flag), Some(slot)) => Ok(UpgradeRecord::new(flag, slot)),
            _ => {
                log::warn!("Unknown upgrade record {flag}/{slot}, treating as idle");
                Ok(UpgradeRecord::default())
            }
        }
    }

    fn store(&mut self, record: UpgradeRecord) -> StoreResult<()> {
        self.record
            .write([record.flag.as_persisted(), record.slot.index()])
    }
}
