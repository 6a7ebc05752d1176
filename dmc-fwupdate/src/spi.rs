// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primary and factory composite packages in external SPI flash.
//!
//! Erase, program, and copy are started by one call and then advanced one
//! flash command at a time by [`SpiPackageManager::continue_operation`], so
//! no call waits on the part.

use crate::config::SpiLayout;
use crate::error::SpiError;
use crate::metadata::Package;
use crate::platform::EraseBlock;
use crate::platform::SpiFlash;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;

pub const SPI_PAGE_SIZE: u32 = 256;

/// Proof that the primary package passed validation, and how many bytes of
/// it are in use. Only package validation hands these out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedPackage {
    len: u32,
}

impl ValidatedPackage {
    pub(crate) fn new(len: u32) -> Self {
        Self { len }
    }

    pub fn len(&self) -> u32 {
        self.len
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpiProgress {
    Idle,
    Pending { done: u32, total: u32 },
    Complete,
    Failed(SpiError),
}

#[derive(Debug)]
struct EraseCursor {
    next: u32,
    end: u32,
}

impl EraseCursor {
    fn new(start: u32, len: u32) -> Self {
        let len = len.div_ceil(EraseBlock::Sector4K.size())
            * EraseBlock::Sector4K.size();
        Self { next: start, end: start + len }
    }

    fn is_done(&self) -> bool {
        self.next >= self.end
    }

    /// The largest block aligned at `next` that does not run past `end`.
    fn block(&self) -> EraseBlock {
        EraseBlock::ALL
            .into_iter()
            .find(|b| {
                self.next % b.size() == 0 && self.next + b.size() <= self.end
            })
            .unwrap_or(EraseBlock::Sector4K)
    }

    fn step(&mut self, flash: &mut dyn SpiFlash) -> Result<(), SpiError> {
        let block = self.block();
        flash.write_enable(true)?;
        flash.erase(self.next, block)?;
        self.next += block.size();
        Ok(())
    }
}

#[derive(Debug)]
enum Operation {
    Erase {
        start: u32,
        cursor: EraseCursor,
    },
    Program {
        addr: u32,
        data: Vec<u8>,
        written: usize,
    },
    Copy {
        from: u32,
        to: u32,
        len: u32,
        erase: EraseCursor,
        copied: u32,
    },
}

enum Step {
    Issued,
    Finished,
}

impl Operation {
    fn progress(&self) -> (u32, u32) {
        match self {
            Operation::Erase { start, cursor } => {
                (cursor.next - start, cursor.end - start)
            }
            Operation::Program { data, written, .. } => {
                (*written as u32, data.len() as u32)
            }
            Operation::Copy { to, len, erase, copied, .. } => {
                // Count the erase and the copy as equal halves.
                let erased = erase.next.min(erase.end) - to;
                let erase_total = erase.end - to;
                let total = erase_total + len;
                (erased + copied, total)
            }
        }
    }

    /// Issue the next flash command, if any remain.
    fn step(&mut self, flash: &mut dyn SpiFlash) -> Result<Step, SpiError> {
        match self {
            Operation::Erase { cursor, .. } => {
                if cursor.is_done() {
                    return Ok(Step::Finished);
                }
                cursor.step(flash)?;
            }
            Operation::Program { addr, data, written } => {
                if *written >= data.len() {
                    return Ok(Step::Finished);
                }
                let at = *addr + *written as u32;
                let room = SPI_PAGE_SIZE - (at & (SPI_PAGE_SIZE - 1));
                let n = (room as usize).min(data.len() - *written);
                flash.write_enable(true)?;
                flash.program(at, &data[*written..*written + n])?;
                *written += n;
            }
            Operation::Copy { from, to, len, erase, copied } => {
                if !erase.is_done() {
                    erase.step(flash)?;
                    return Ok(Step::Issued);
                }
                if *copied >= *len {
                    return Ok(Step::Finished);
                }
                let at = *to + *copied;
                let room = SPI_PAGE_SIZE - (at & (SPI_PAGE_SIZE - 1));
                let n = room.min(*len - *copied);
                let mut page = [0; SPI_PAGE_SIZE as usize];
                let page = &mut page[..n as usize];
                flash.read(*from + *copied, page)?;
                flash.write_enable(true)?;
                flash.program(at, page)?;
                *copied += n;
            }
        }
        Ok(Step::Issued)
    }
}

pub struct SpiPackageManager {
    flash: Box<dyn SpiFlash + Send>,
    layout: SpiLayout,
    op: Option<Operation>,
    last_result: Option<Result<(), SpiError>>,
    log: Logger,
}

impl SpiPackageManager {
    pub fn new(
        flash: Box<dyn SpiFlash + Send>,
        layout: SpiLayout,
        log: &Logger,
    ) -> Self {
        Self {
            flash,
            layout,
            op: None,
            last_result: None,
            log: log.new(o!("component" => "spi")),
        }
    }

    pub fn layout(&self) -> &SpiLayout {
        &self.layout
    }

    pub fn base(&self, package: Package) -> u32 {
        match package {
            Package::Primary => self.layout.primary_addr,
            Package::Factory => self.layout.factory_addr,
        }
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<(), SpiError> {
        let end = u64::from(offset) + len as u64;
        if end > u64::from(self.layout.package_size) {
            return Err(SpiError::OutOfBounds { addr: offset, len });
        }
        Ok(())
    }

    fn start(&mut self, op: Operation) -> Result<(), SpiError> {
        if self.op.is_some() {
            return Err(SpiError::Busy);
        }
        self.last_result = None;
        self.op = Some(op);
        Ok(())
    }

    /// Read package bytes. Reads are short and complete synchronously, but
    /// are refused while an erase or program is outstanding.
    pub fn read(
        &mut self,
        package: Package,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), SpiError> {
        if self.op.is_some() || self.flash.is_busy() {
            return Err(SpiError::Busy);
        }
        self.check_range(offset, buf.len())?;
        self.flash.read(self.base(package) + offset, buf)
    }

    /// Start erasing the first `len` bytes of a package, rounded up to the
    /// smallest erase unit.
    pub fn erase_region(
        &mut self,
        package: Package,
        len: u32,
    ) -> Result<(), SpiError> {
        self.check_range(0, len as usize)?;
        let start = self.base(package);
        debug!(
            self.log, "erasing package";
            "package" => <&str>::from(package),
            "len" => len,
        );
        self.start(Operation::Erase {
            start,
            cursor: EraseCursor::new(start, len),
        })
    }

    /// Start programming `data` at `offset` into an erased package, split at
    /// page boundaries.
    pub fn write(
        &mut self,
        package: Package,
        offset: u32,
        data: &[u8],
    ) -> Result<(), SpiError> {
        self.check_range(offset, data.len())?;
        let addr = self.base(package) + offset;
        self.start(Operation::Program { addr, data: data.to_vec(), written: 0 })
    }

    /// Start replacing the factory package with the validated primary one.
    pub fn copy_primary_to_factory(
        &mut self,
        package: &ValidatedPackage,
    ) -> Result<(), SpiError> {
        self.check_range(0, package.len() as usize)?;
        let from = self.layout.primary_addr;
        let to = self.layout.factory_addr;
        debug!(self.log, "copying primary package to factory"; "len" => package.len());
        self.start(Operation::Copy {
            from,
            to,
            len: package.len(),
            erase: EraseCursor::new(to, package.len()),
            copied: 0,
        })
    }

    /// Advance the outstanding operation by at most one flash command.
    pub fn continue_operation(&mut self) -> SpiProgress {
        let Some(op) = self.op.as_mut() else {
            return SpiProgress::Idle;
        };
        let (done, total) = op.progress();
        if self.flash.is_busy() {
            return SpiProgress::Pending { done, total };
        }
        match op.step(&mut *self.flash) {
            Ok(Step::Issued) => {
                let (done, total) = op.progress();
                SpiProgress::Pending { done, total }
            }
            Ok(Step::Finished) => {
                self.op = None;
                self.last_result = Some(Ok(()));
                SpiProgress::Complete
            }
            Err(err) => {
                warn!(self.log, "SPI operation failed"; &err);
                self.op = None;
                // Leave the part write-protected; nothing useful can be done
                // if this fails too.
                let _ = self.flash.write_enable(false);
                self.last_result = Some(Err(err.clone()));
                SpiProgress::Failed(err)
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.op.is_some()
    }

    /// The outcome of the last finished operation, once.
    pub fn take_result(&mut self) -> Option<Result<(), SpiError>> {
        self.last_result.take()
    }

    /// Drop any outstanding operation. A command already issued to the part
    /// still runs to completion.
    pub fn cancel(&mut self) {
        if self.op.take().is_some() {
            debug!(self.log, "SPI operation canceled");
        }
        self.last_result = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimSpiFlash;

    const PRIMARY: u32 = 0;
    const FACTORY: u32 = 0x2_0000;

    fn manager(flash: &SimSpiFlash) -> SpiPackageManager {
        let log = Logger::root(slog::Discard, o!());
        SpiPackageManager::new(
            Box::new(flash.clone()),
            SpiLayout {
                primary_addr: PRIMARY,
                factory_addr: FACTORY,
                package_size: 0x2_0000,
            },
            &log,
        )
    }

    fn run(spi: &mut SpiPackageManager) -> (SpiProgress, usize) {
        let mut ticks = 0;
        loop {
            ticks += 1;
            match spi.continue_operation() {
                SpiProgress::Pending { done, total } => assert!(done <= total),
                other => return (other, ticks),
            }
            assert!(ticks < 10_000);
        }
    }

    #[test]
    fn erase_uses_largest_blocks() {
        let flash = SimSpiFlash::new(0x4_0000);
        let mut spi = manager(&flash);
        // 64K + 32K + 4K + a partial sector rounded up.
        spi.erase_region(Package::Primary, 0x1_8000 + 0x1000 + 10).unwrap();
        assert_eq!(run(&mut spi).0, SpiProgress::Complete);
        assert_eq!(
            flash.erases(),
            vec![
                (0, EraseBlock::Block64K),
                (0x1_0000, EraseBlock::Block32K),
                (0x1_8000, EraseBlock::Sector4K),
                (0x1_9000, EraseBlock::Sector4K),
            ]
        );
        assert_eq!(spi.take_result(), Some(Ok(())));
        assert_eq!(spi.take_result(), None);
    }

    #[test]
    fn unaligned_write_is_split_at_pages() {
        let flash = SimSpiFlash::new(0x4_0000);
        let mut spi = manager(&flash);
        let data = (0..600u32).map(|i| i as u8).collect::<Vec<_>>();
        spi.write(Package::Primary, 0x80, &data).unwrap();
        assert_eq!(run(&mut spi).0, SpiProgress::Complete);
        assert_eq!(
            flash.programs(),
            vec![(0x80, 128), (0x100, 256), (0x200, 216)]
        );
        assert_eq!(flash.contents(0x80, 600), data);
    }

    #[test]
    fn busy_part_is_polled_not_driven() {
        let flash = SimSpiFlash::new(0x4_0000);
        flash.set_busy_ticks(5);
        let mut spi = manager(&flash);
        spi.erase_region(Package::Factory, 0x1000).unwrap();
        let (progress, ticks) = run(&mut spi);
        assert_eq!(progress, SpiProgress::Complete);
        assert!(ticks > 5);
        assert_eq!(flash.erases(), vec![(FACTORY, EraseBlock::Sector4K)]);
    }

    #[test]
    fn one_operation_at_a_time() {
        let flash = SimSpiFlash::new(0x4_0000);
        let mut spi = manager(&flash);
        spi.erase_region(Package::Primary, 0x1000).unwrap();
        assert_eq!(
            spi.write(Package::Primary, 0, &[1, 2, 3]),
            Err(SpiError::Busy)
        );
        let mut buf = [0; 4];
        assert_eq!(
            spi.read(Package::Primary, 0, &mut buf),
            Err(SpiError::Busy)
        );
        spi.cancel();
        assert!(!spi.is_busy());
        assert_eq!(spi.continue_operation(), SpiProgress::Idle);
    }

    #[test]
    fn out_of_bounds() {
        let flash = SimSpiFlash::new(0x4_0000);
        let mut spi = manager(&flash);
        assert!(matches!(
            spi.write(Package::Primary, 0x1_FFFF, &[0; 2]),
            Err(SpiError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn copy_erases_then_copies() {
        let flash = SimSpiFlash::new(0x4_0000);
        let package = (0..5000u32).map(|i| (i * 7) as u8).collect::<Vec<_>>();
        flash.load(PRIMARY, &package);
        flash.load(FACTORY, &[0x00; 0x3000]);

        let mut spi = manager(&flash);
        spi.copy_primary_to_factory(&ValidatedPackage::new(5000)).unwrap();
        assert_eq!(run(&mut spi).0, SpiProgress::Complete);
        assert_eq!(flash.contents(FACTORY, 5000), package);
        // Erased through the end of the last sector touched.
        assert_eq!(flash.contents(FACTORY + 5000, 10), vec![0xFF; 10]);
        assert_eq!(flash.contents(FACTORY + 0x2000, 4), vec![0x00; 4]);
    }

    #[test]
    fn read_failure_aborts_copy() {
        let flash = SimSpiFlash::new(0x4_0000);
        let mut spi = manager(&flash);
        spi.copy_primary_to_factory(&ValidatedPackage::new(1024)).unwrap();
        flash.fail_reads(true);
        let (progress, _) = run(&mut spi);
        assert!(matches!(progress, SpiProgress::Failed(SpiError::ReadFailed { .. })));
        assert!(!spi.is_busy());
        assert!(matches!(spi.take_result(), Some(Err(_))));
    }
}
