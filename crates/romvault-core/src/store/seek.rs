use std::cmp;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

const DISCARD_BUFFER: usize = 64 * 1024;

/// Seek emulation over a forward-only stream.
///
/// Every byte pulled from `inner` is appended to an anonymous spill file.
/// Positions already pulled are served from the spill; seeking past them
/// pulls (and spills) the intervening bytes.
pub struct ForwardSeekReader<R: Read> {
    inner: R,
    spill: File,
    spilled: u64,
    pos: u64,
    len: u64,
}

impl<R: Read> ForwardSeekReader<R> {
    pub fn new(inner: R, len: u64) -> io::Result<Self> {
        Ok(Self::with_spill(inner, len, tempfile::tempfile()?))
    }

    pub fn new_in(inner: R, len: u64, dir: &Path) -> io::Result<Self> {
        Ok(Self::with_spill(inner, len, tempfile::tempfile_in(dir)?))
    }

    fn with_spill(inner: R, len: u64, spill: File) -> Self {
        Self {
            inner,
            spill,
            spilled: 0,
            pos: 0,
            len,
        }
    }

    /// Uncompressed length reported by the store.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Read up to `buf.len()` bytes at `offset`, stopping early only at the
    /// end of the stream.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn append_spill(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.spill.seek(SeekFrom::Start(self.spilled))?;
        self.spill.write_all(bytes)?;
        self.spilled += bytes.len() as u64;
        Ok(())
    }

    /// Pull from `inner` until `target` bytes have been spilled or the stream ends.
    fn advance_to(&mut self, target: u64) -> io::Result<()> {
        let mut scratch = vec![0u8; DISCARD_BUFFER];
        while self.spilled < target {
            let want = cmp::min(scratch.len() as u64, target - self.spilled) as usize;
            let n = self.inner.read(&mut scratch[..want])?;
            if n == 0 {
                break;
            }
            self.append_spill(&scratch[..n])?;
        }
        Ok(())
    }
}

impl<R: Read> Read for ForwardSeekReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos < self.spilled {
            let available = cmp::min(buf.len() as u64, self.spilled - self.pos) as usize;
            self.spill.seek(SeekFrom::Start(self.pos))?;
            let n = self.spill.read(&mut buf[..available])?;
            self.pos += n as u64;
            return Ok(n);
        }
        if self.pos > self.spilled {
            // sought past the end of the stream
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.append_spill(&buf[..n])?;
            self.pos += n as u64;
        }
        Ok(n)
    }
}

impl<R: Read> Seek for ForwardSeekReader<R> {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        let target = match from {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.len as i128 + d as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        let target = target as u64;
        if target > self.spilled {
            self.advance_to(target)?;
        }
        self.pos = target;
        Ok(self.pos)
    }
}
