use super::ByteSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;

/// A local text file exposed as a [`ByteSource`]
pub struct LocalFile {
    file: std::fs::File,
    size: u64,
}

impl LocalFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            let mut filled = 0;
            while filled < buf.len() {
                let n = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok(filled)
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut filled = 0;
            while filled < buf.len() {
                let n = self.file.seek_read(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok(filled)
        }

        #[cfg(not(any(unix, windows)))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut file = &self.file;
            file.seek(SeekFrom::Start(offset))?;
            Ok(file.read(buf)?)
        }
    }
}

#[async_trait]
impl ByteSource for LocalFile {
    async fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    async fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        if self.size == 0 || start >= self.size || start > end {
            return Ok(Vec::new());
        }
        let end = end.min(self.size - 1);
        let mut buf = vec![0u8; (end - start + 1) as usize];
        let n = self.read_at(start, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}
