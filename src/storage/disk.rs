use crate::storage::page::PageId;
use anyhow::{Context, Result, bail};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 4096;

/// Page-granular file I/O plus page id allocation.
///
/// The allocator hands out ids from a (first, stride) counter so that each
/// instance of a partitioned buffer pool owns a disjoint residue class of the
/// page id space. A plain pool uses the default (0, 1).
pub struct DiskManager {
    file: File,
    next_page_id: u32,
    stride: u32,
}

impl DiskManager {
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_with_stride(path, 0, 1)
    }

    pub fn create_with_stride(path: &Path, first_page_id: u32, stride: u32) -> Result<Self> {
        assert!(stride > 0);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;

        Ok(Self {
            file,
            next_page_id: first_page_id,
            stride,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_stride(path, 0, 1)
    }

    pub fn open_with_stride(path: &Path, first_page_id: u32, stride: u32) -> Result<Self> {
        assert!(stride > 0);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open file: {:?}", path))?;

        let mut manager = Self {
            file,
            next_page_id: first_page_id,
            stride,
        };

        // Resume allocation past any page already present in the file,
        // staying on this instance's residue class.
        let num_pages = manager.num_pages()?;
        while manager.next_page_id < num_pages {
            manager.next_page_id += manager.stride;
        }

        Ok(manager)
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            bail!(
                "Buffer size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                buf.len()
            );
        }

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            bail!("Page {} does not exist", page_id.0);
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.read_exact(buf).context("Failed to read page")?;

        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            bail!(
                "Data size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                data.len()
            );
        }

        // Writing past the end of file extends it; no explicit truncation so
        // that partitioned instances writing through separate handles never
        // clip each other's pages.
        let offset = Self::page_offset(page_id);
        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.write_all(data).context("Failed to write page")?;
        self.file.sync_all().context("Failed to sync")?;

        Ok(())
    }

    pub fn allocate_page(&mut self) -> PageId {
        let page_id = PageId(self.next_page_id);
        self.next_page_id += self.stride;
        page_id
    }

    /// The file is never shrunk; the id simply becomes dead until the file is
    /// rebuilt offline.
    pub fn deallocate_page(&mut self, page_id: PageId) {
        log::debug!("deallocate page {}", page_id.0);
    }

    pub fn num_pages(&self) -> Result<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        // Create new file
        {
            let dm = DiskManager::create(&file_path)?;
            assert_eq!(dm.num_pages()?, 0);
        }

        // Open existing file
        {
            let dm = DiskManager::open(&file_path)?;
            assert_eq!(dm.num_pages()?, 0);
        }

        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut dm = DiskManager::create(&file_path)?;

        let mut write_buf = vec![0u8; PAGE_SIZE];
        write_buf[0] = 42;
        write_buf[PAGE_SIZE - 1] = 24;
        dm.write_page(PageId(0), &write_buf)?;

        let mut read_buf = vec![0u8; PAGE_SIZE];
        dm.read_page(PageId(0), &mut read_buf)?;

        assert_eq!(read_buf[0], 42);
        assert_eq!(read_buf[PAGE_SIZE - 1], 24);

        Ok(())
    }

    #[test]
    fn test_multiple_pages() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut dm = DiskManager::create(&file_path)?;

        for i in 0..5 {
            let mut buf = vec![0u8; PAGE_SIZE];
            buf[0] = i as u8;
            dm.write_page(PageId(i), &buf)?;
        }

        assert_eq!(dm.num_pages()?, 5);

        for i in 0..5 {
            let mut buf = vec![0u8; PAGE_SIZE];
            dm.read_page(PageId(i), &mut buf)?;
            assert_eq!(buf[0], i as u8);
        }

        Ok(())
    }

    #[test]
    fn test_read_nonexistent_page() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut dm = DiskManager::create(&file_path)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(dm.read_page(PageId(10), &mut buf).is_err());

        Ok(())
    }

    #[test]
    fn test_invalid_buffer_size() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut dm = DiskManager::create(&file_path)?;

        let mut small_buf = vec![0u8; 100];
        assert!(dm.read_page(PageId(0), &mut small_buf).is_err());

        let small_data = vec![0u8; 100];
        assert!(dm.write_page(PageId(0), &small_data).is_err());

        Ok(())
    }

    #[test]
    fn test_sequential_allocation() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut dm = DiskManager::create(&file_path)?;

        assert_eq!(dm.allocate_page(), PageId(0));
        assert_eq!(dm.allocate_page(), PageId(1));
        assert_eq!(dm.allocate_page(), PageId(2));

        Ok(())
    }

    #[test]
    fn test_strided_allocation() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut dm = DiskManager::create_with_stride(&file_path, 1, 3)?;

        assert_eq!(dm.allocate_page(), PageId(1));
        assert_eq!(dm.allocate_page(), PageId(4));
        assert_eq!(dm.allocate_page(), PageId(7));

        Ok(())
    }

    #[test]
    fn test_allocation_resumes_after_reopen() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let mut dm = DiskManager::create(&file_path)?;
            let id = dm.allocate_page();
            dm.write_page(id, &vec![9u8; PAGE_SIZE])?;
        }

        {
            let mut dm = DiskManager::open(&file_path)?;
            assert_eq!(dm.allocate_page(), PageId(1));
        }

        Ok(())
    }

    #[test]
    fn test_persistence() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let mut dm = DiskManager::create(&file_path)?;
            let buf = vec![99u8; PAGE_SIZE];
            dm.write_page(PageId(0), &buf)?;
        }

        {
            let mut dm = DiskManager::open(&file_path)?;
            let mut buf = vec![0u8; PAGE_SIZE];
            dm.read_page(PageId(0), &mut buf)?;
            assert_eq!(buf[0], 99);
        }

        Ok(())
    }
}
