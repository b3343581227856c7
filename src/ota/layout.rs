use thiserror::Error;

pub const SECTOR_SIZE: u32 = 0x1000;
/// Headroom kept between the largest accepted image and the end of its slot.
const IMAGE_HEADROOM: u32 = SECTOR_SIZE;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Region at {0:#x} is not sector aligned")]
    Unaligned(u32),
    #[error("Region at {0:#x} is too small")]
    TooSmall(u32),
    #[error("Regions at {0:#x} and {1:#x} overlap")]
    Overlapping(u32, u32),
}

pub type LayoutResult<T> = Result<T, LayoutError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareSlot {
    A,
    B,
}

impl FirmwareSlot {
    /// Number used in image file names (`rom0.bin`, `rom1.bin`).
    pub const fn index(self) -> u8 {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::A),
            1 => Some(Self::B),
            _ => None,
        }
    }

    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl core::fmt::Display for FirmwareSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

/// A span of flash, absolute offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRegion {
    base: u32,
    size: u32,
}

impl SlotRegion {
    pub const fn new(base: u32, size: u32) -> Self {
        Self { base, size }
    }

    pub const fn base(&self) -> u32 {
        self.base
    }

    pub const fn size(&self) -> u32 {
        self.size
    }

    pub const fn end(&self) -> u32 {
        self.base + self.size
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    fn validate(&self, min_size: u32) -> LayoutResult<()> {
        if self.base % SECTOR_SIZE != 0 || self.size % SECTOR_SIZE != 0 {
            return Err(LayoutError::Unaligned(self.base));
        }
        if self.size < min_size || self.base.checked_add(self.size).is_none() {
            return Err(LayoutError::TooSmall(self.base));
        }
        Ok(())
    }
}

/// Where the firmware slots and the persistent upgrade record live.
///
/// Built from the partition table: slot A is the `ota_0` app partition, slot B
/// the `ota_1` one, and the record takes the first sector of its own data
/// partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLayout {
    slots: [SlotRegion; 2],
    max_image_size: u32,
    upgrade_record: SlotRegion,
}

impl FlashLayout {
    pub fn new(slots: [SlotRegion; 2], upgrade_record: SlotRegion) -> LayoutResult<Self> {
        for slot in &slots {
            slot.validate(IMAGE_HEADROOM + SECTOR_SIZE)?;
        }
        upgrade_record.validate(SECTOR_SIZE)?;

        let [a, b] = slots;
        for (first, second) in [(a, b), (a, upgrade_record), (b, upgrade_record)] {
            if first.overlaps(&second) {
                return Err(LayoutError::Overlapping(first.base, second.base));
            }
        }

        Ok(Self {
            slots,
            max_image_size: a.size.min(b.size) - IMAGE_HEADROOM,
            upgrade_record: SlotRegion::new(upgrade_record.base, SECTOR_SIZE),
        })
    }

    pub fn slot(&self, slot: FirmwareSlot) -> SlotRegion {
        self.slots[usize::from(slot.index())]
    }

    pub fn max_image_size(&self) -> u32 {
        self.max_image_size
    }

    pub fn upgrade_record_offset(&self) -> u32 {
        self.upgrade_record.base
    }
}
