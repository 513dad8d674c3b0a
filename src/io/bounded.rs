//! Read-count limited access to a random-access byte source.
//!
//! Archive metadata extraction seeks all over a file; a hostile archive can
//! make that arbitrarily expensive. `BoundedReader` caps the total number of
//! bytes handed out across all reads. The read that would cross the budget
//! returns [`BoundedReadError::LimitExceeded`] and the registered observer is
//! notified, exactly once, at that crossing point. Every later read fails the
//! same way.

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Positioned reads that do not move a shared cursor.
pub trait ReadAt {
    /// Read into `buf` starting at `offset`. Returns `Ok(0)` at end of input.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let start = match usize::try_from(offset) {
            Ok(start) if start < self.len() => start,
            _ => return Ok(0),
        };
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }
}

#[cfg(unix)]
impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

/// The budget was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("read limit of {limit} bytes exceeded")]
pub struct LimitExceeded {
    pub limit: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BoundedReadError {
    #[error(transparent)]
    LimitExceeded(#[from] LimitExceeded),

    #[error(transparent)]
    Io(#[from] io::Error),
}

type Observer = Box<dyn FnOnce(LimitExceeded) + Send>;

/// A [`ReadAt`] wrapper that hands out at most `limit` bytes in total.
pub struct BoundedReader<R> {
    inner: R,
    limit: u64,
    consumed: AtomicU64,
    on_exceed: Mutex<Option<Observer>>,
}

impl<R: ReadAt> BoundedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            limit,
            consumed: AtomicU64::new(0),
            on_exceed: Mutex::new(None),
        }
    }

    /// Register a hook that runs the first time a read hits the limit.
    pub fn on_limit_exceeded(self, observer: impl FnOnce(LimitExceeded) + Send + 'static) -> Self {
        if let Ok(mut slot) = self.on_exceed.lock() {
            *slot = Some(Box::new(observer));
        }
        self
    }

    /// Bytes handed out so far.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Positioned read charged against the budget.
    ///
    /// A read that would hand out more than the remaining budget fails with
    /// `LimitExceeded`. A read that runs into end of input inside the budget
    /// succeeds with the short count.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, BoundedReadError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let wanted = buf.len() as u64;
        let granted = self.reserve(wanted)?;
        let window = granted as usize;
        let read = self.inner.read_at(&mut buf[..window], offset);

        // Give back whatever the inner reader did not use.
        let used = *read.as_ref().unwrap_or(&0) as u64;
        let unused = granted - used;
        if unused > 0 {
            self.consumed.fetch_sub(unused, Ordering::AcqRel);
        }

        let n = read?;
        // The window was cut short and the source still had bytes for it.
        if granted < wanted && n == window {
            return Err(self.exceeded().into());
        }
        Ok(n)
    }

    /// Claim up to `wanted` bytes of budget. Returns how much was granted.
    fn reserve(&self, wanted: u64) -> Result<u64, LimitExceeded> {
        let mut current = self.consumed.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return Err(self.exceeded());
            }
            let grant = wanted.min(self.limit - current);
            match self.consumed.compare_exchange_weak(
                current,
                current + grant,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(grant),
                Err(actual) => current = actual,
            }
        }
    }

    fn exceeded(&self) -> LimitExceeded {
        let err = LimitExceeded { limit: self.limit };
        let observer = self.on_exceed.lock().ok().and_then(|mut slot| slot.take());
        if let Some(observer) = observer {
            tracing::warn!(limit = self.limit, "Read limit exceeded");
            observer(err);
        }
        err
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
