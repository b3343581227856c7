use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};

use super::{
    layout::{FlashLayout, SlotRegion},
    store::{StoreResult, UpgradeFlag, UpgradeFlagStore, UpgradeRecord},
};

/// A 2 MiB part partitioned like the firmware's `partitions.csv`.
pub const FLASH_SIZE: u32 = 0x20_0000;

pub fn layout() -> FlashLayout {
    let ota_0 = SlotRegion::new(0x10000, 0xE0000);
    let ota_1 = SlotRegion::new(0xF0000, 0xE0000);
    let upgrade = SlotRegion::new(0x1D0000, 0x1000);
    match FlashLayout::new([ota_0, ota_1], upgrade) {
        Ok(layout) => layout,
        Err(err) => panic!("test partition map rejected: {err}"),
    }
}

/// NOR flash in RAM: erase sets bytes to `0xFF`, writes can only clear bits.
pub(crate) struct RamFlash {
    pub data: Vec<u8>,
    pub erases: Vec<(u32, u32)>,
    pub fail_writes: bool,
}

impl RamFlash {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0xFF; size],
            erases: Vec::new(),
            fail_writes: false,
        }
    }

    fn check(&self, offset: u32, len: usize, align: usize) -> Result<(), NorFlashErrorKind> {
        if offset as usize % align != 0 || len % align != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if offset as usize + len > self.data.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        Ok(())
    }
}

impl ErrorType for RamFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for RamFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check(offset, bytes.len(), Self::READ_SIZE)?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for RamFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = 4096;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if to < from {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        self.check(from, (to - from) as usize, Self::ERASE_SIZE)?;
        self.data[from as usize..to as usize].fill(0xFF);
        self.erases.push((from, to));
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if self.fail_writes {
            return Err(NorFlashErrorKind::Other);
        }
        self.check(offset, bytes.len(), Self::WRITE_SIZE)?;
        let start = offset as usize;
        for (cell, byte) in self.data[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= byte;
        }
        Ok(())
    }
}

/// Flag store that keeps every write, optionally losing `Finished` writes.
#[derive(Default)]
pub(crate) struct MemoryFlagStore {
    pub record: UpgradeRecord,
    pub history: Vec<UpgradeRecord>,
    pub drop_finished: bool,
}

impl MemoryFlagStore {
    pub fn with_record(record: UpgradeRecord) -> Self {
        Self {
            record,
            ..Default::default()
        }
    }
}

impl UpgradeFlagStore for MemoryFlagStore {
    fn load(&mut self) -> StoreResult<UpgradeRecord> {
        Ok(self.record)
    }

    fn store(&mut self, record: UpgradeRecord) -> StoreResult<()> {
        self.history.push(record);
        if !(self.drop_finished && record.flag == UpgradeFlag::Finished) {
            self.record = record;
        }
        Ok(())
    }
}
