use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

use super::layout::SlotRegion;

/// Largest `NorFlash::WRITE_SIZE` the writer can buffer.
pub const MAX_WRITE_SIZE: usize = 16;

/// Streams an image of known length into a firmware slot.
///
/// Sectors are erased just ahead of the write position and never past the
/// sectors that cover the image. Bytes that do not fill a whole write unit are
/// held back until the next chunk; the final unit is padded with `0xFF`.
#[derive(Debug)]
pub struct SlotWriter {
    region: SlotRegion,
    length: u32,
    written: u32,
    erased: u32,
    carry: [u8; MAX_WRITE_SIZE],
    carry_len: usize,
}

impl SlotWriter {
    pub fn new<F: NorFlash>(region: SlotRegion, length: u32) -> Result<Self, NorFlashErrorKind> {
        if F::WRITE_SIZE > MAX_WRITE_SIZE {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if length > region.size() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }

        Ok(Self {
            region,
            length,
            written: 0,
            erased: 0,
            carry: [0xFF; MAX_WRITE_SIZE],
            carry_len: 0,
        })
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// Bytes accepted so far, including any not yet programmed.
    pub fn received(&self) -> u32 {
        self.written + self.carry_len as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.length
    }

    pub fn write<F: NorFlash>(&mut self, flash: &mut F, mut data: &[u8]) -> Result<(), NorFlashErrorKind> {
        let unit = F::WRITE_SIZE;
        if self.received() as usize + data.len() > self.length as usize {
            return Err(NorFlashErrorKind::OutOfBounds);
        }

        if self.carry_len > 0 {
            let take = (unit - self.carry_len).min(data.len());
            self.carry[self.carry_len..self.carry_len + take].copy_from_slice(&data[..take]);
            self.carry_len += take;
            data = &data[take..];

            if self.carry_len == unit {
                let carry = self.carry;
                self.program(flash, &carry[..unit])?;
                self.carry_len = 0;
            }
        }

        let aligned = data.len() - data.len() % unit;
        if aligned > 0 {
            self.program(flash, &data[..aligned])?;
        }

        let rest = &data[aligned..];
        self.carry[self.carry_len..self.carry_len + rest.len()].copy_from_slice(rest);
        self.carry_len += rest.len();
        Ok(())
    }

    /// Programs the held back tail, padded to a whole write unit.
    pub fn finish<F: NorFlash>(&mut self, flash: &mut F) -> Result<(), NorFlashErrorKind> {
        if self.carry_len == 0 {
            return Ok(());
        }

        let mut tail = [0xFF; MAX_WRITE_SIZE];
        tail[..self.carry_len].copy_from_slice(&self.carry[..self.carry_len]);
        self.program(flash, &tail[..F::WRITE_SIZE])?;
        // Padding is not part of the image.
        self.written -= (F::WRITE_SIZE - self.carry_len) as u32;
        self.carry_len = 0;
        Ok(())
    }

    fn program<F: NorFlash>(&mut self, flash: &mut F, bytes: &[u8]) -> Result<(), NorFlashErrorKind> {
        let end = self.written + bytes.len() as u32;
        self.erase_until(flash, end)?;

        flash
            .write(self.region.base() + self.written, bytes)
            .map_err(|err| err.kind())?;
        self.written = end;
        Ok(())
    }

    fn erase_until<F: NorFlash>(&mut self, flash: &mut F, end: u32) -> Result<(), NorFlashErrorKind> {
        if end <= self.erased {
            return Ok(());
        }

        let sector = F::ERASE_SIZE as u32;
        let limit = self.length.div_ceil(sector) * sector;
        let target = (end.div_ceil(sector) * sector).min(limit);

        flash
            .erase(self.region.base() + self.erased, self.region.base() + target)
            .map_err(|err| err.kind())?;
        self.erased = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::{
        layout::FirmwareSlot,
        testing::{self, FLASH_SIZE, RamFlash},
    };

    fn slot_b() -> SlotRegion {
        testing::layout().slot(FirmwareSlot::B)
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn odd_chunks_land_contiguously() {
        let mut flash = RamFlash::new(FLASH_SIZE as usize);
        let data = image(10_003);
        let mut writer = SlotWriter::new::<RamFlash>(slot_b(), data.len() as u32).unwrap();

        for chunk in data.chunks(1_461) {
            writer.write(&mut flash, chunk).unwrap();
        }
        assert!(writer.is_complete());
        writer.finish(&mut flash).unwrap();

        let base = slot_b().base() as usize;
        assert_eq!(&flash.data[base..base + data.len()], &data[..]);
        assert_eq!(flash.data[base + data.len()], 0xFF);
        assert_eq!(writer.received(), 10_003);
    }

    #[test]
    fn erases_lazily_and_only_covering_sectors() {
        let mut flash = RamFlash::new(FLASH_SIZE as usize);
        let base = slot_b().base();
        let mut writer = SlotWriter::new::<RamFlash>(slot_b(), 5_000).unwrap();

        writer.write(&mut flash, &image(100)).unwrap();
        assert_eq!(flash.erases, vec![(base, base + 0x1000)]);

        writer.write(&mut flash, &image(4_900)).unwrap();
        writer.finish(&mut flash).unwrap();
        assert_eq!(
            flash.erases,
            vec![(base, base + 0x1000), (base + 0x1000, base + 0x2000)]
        );
    }

    #[test]
    fn refuses_bytes_past_length() {
        let mut flash = RamFlash::new(FLASH_SIZE as usize);
        let mut writer = SlotWriter::new::<RamFlash>(slot_b(), 8).unwrap();
        writer.write(&mut flash, &image(6)).unwrap();
        assert_eq!(
            writer.write(&mut flash, &image(3)),
            Err(NorFlashErrorKind::OutOfBounds)
        );
    }

    #[test]
    fn image_larger_than_region_is_rejected() {
        assert_eq!(
            SlotWriter::new::<RamFlash>(slot_b(), slot_b().size() + 1).unwrap_err(),
            NorFlashErrorKind::OutOfBounds
        );
    }
}
