//! Partition table lookups and boot selection through the otadata partition
//! read by the esp-idf second stage bootloader.

use esp_bootloader_esp_idf::{
    ota::{Ota, Slot},
    partitions::{
        self, AppPartitionSubType, DataPartitionSubType, Error as PartitionError,
        PARTITION_TABLE_MAX_LEN, PartitionEntry, PartitionTable, PartitionType,
    },
};
use esp_storage::FlashStorage;
use net_dot_clock::{
    impl_from_variant, mk_static,
    ota::layout::{FirmwareSlot, FlashLayout, LayoutError, SlotRegion},
};
use thiserror::Error;

/// `upgrade` partition in `partitions.csv`.
const UPGRADE_RECORD: PartitionType = PartitionType::Data(DataPartitionSubType::Undefined);
const OTADATA: PartitionType = PartitionType::Data(DataPartitionSubType::Ota);

#[derive(Debug, Error)]
pub enum BootError {
    #[error("Partition table error: {0:?}")]
    Partitions(PartitionError),
    #[error("No {0} partition")]
    MissingPartition(&'static str),
    #[error("Flash layout error: {0}")]
    Layout(#[from] LayoutError),
}
impl_from_variant!(BootError, Partitions, PartitionError);

pub type BootResult<T> = Result<T, BootError>;

/// The partition table, read once at startup.
pub struct Partitions {
    table: PartitionTable<'static>,
}

impl Partitions {
    pub fn read(flash: &mut FlashStorage) -> BootResult<Self> {
        let buffer = mk_static!([u8; PARTITION_TABLE_MAX_LEN], [0u8; PARTITION_TABLE_MAX_LEN]);
        let table = partitions::read_partition_table(flash, buffer)?;
        Ok(Self { table })
    }

    /// Slot A is `ota_0`, slot B is `ota_1`.
    pub fn flash_layout(&self) -> BootResult<FlashLayout> {
        let a = self.region(PartitionType::App(AppPartitionSubType::Ota0), "ota_0")?;
        let b = self.region(PartitionType::App(AppPartitionSubType::Ota1), "ota_1")?;
        let record = self.region(UPGRADE_RECORD, "upgrade")?;
        Ok(FlashLayout::new([a, b], record)?)
    }

    fn region(&self, kind: PartitionType, name: &'static str) -> BootResult<SlotRegion> {
        let entry = self.find(kind, name)?;
        log::info!(
            "Partition {name} at {:#x}, {:#x} bytes",
            entry.offset(),
            entry.len()
        );
        Ok(SlotRegion::new(entry.offset(), entry.len()))
    }

    fn find(&self, kind: PartitionType, name: &'static str) -> BootResult<PartitionEntry<'static>> {
        self.table
            .find_partition(kind)?
            .ok_or(BootError::MissingPartition(name))
    }
}

/// Reads and switches the app slot the bootloader starts.
pub struct OtaBootSelector {
    partitions: Partitions,
    flash: FlashStorage,
}

impl OtaBootSelector {
    pub fn new(partitions: Partitions, flash: FlashStorage) -> Self {
        Self { partitions, flash }
    }

    /// Blank otadata boots `ota_0`, as there is no factory app.
    pub fn active_slot(&mut self) -> BootResult<FirmwareSlot> {
        let mut otadata = self
            .partitions
            .find(OTADATA, "otadata")?
            .as_embedded_storage(&mut self.flash);
        let current = Ota::new(&mut otadata)?.current_slot()?;
        Ok(match current {
            Slot::Slot1 => FirmwareSlot::B,
            Slot::None | Slot::Slot0 => FirmwareSlot::A,
        })
    }

    pub fn select(&mut self, slot: FirmwareSlot) -> BootResult<()> {
        let next = match slot {
            FirmwareSlot::A => Slot::Slot0,
            FirmwareSlot::B => Slot::Slot1,
        };
        let mut otadata = self
            .partitions
            .find(OTADATA, "otadata")?
            .as_embedded_storage(&mut self.flash);
        Ota::new(&mut otadata)?.set_current_slot(next)?;
        Ok(())
    }
}
