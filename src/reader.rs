/// Record reader with an inactivity watchdog.
///
/// Splits an async byte stream into delimiter-terminated records and fails
/// with [`ReaderError::TimedOut`] when no record arrives within the configured
/// window. The watchdog polls a shared [`ActivityClock`]; it lives inside the
/// read call and is dropped on every exit path.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

/// Watchdog wake-up interval when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 8 * 1024;

/// Errors produced while reading records.
#[derive(Debug)]
pub enum ReaderError {
    /// No record arrived for longer than `timeout`.
    TimedOut { idle: Duration, timeout: Duration },
    /// The underlying stream failed.
    Io { source: std::io::Error },
}

impl std::fmt::Display for ReaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderError::TimedOut { idle, timeout } => write!(
                f,
                "output wait time expired: no record for {:.1}s (limit {:.1}s)",
                idle.as_secs_f64(),
                timeout.as_secs_f64()
            ),
            ReaderError::Io { source } => write!(f, "I/O error while reading records: {}", source),
        }
    }
}

impl std::error::Error for ReaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReaderError::TimedOut { .. } => None,
            ReaderError::Io { source } => Some(source),
        }
    }
}

/// "Last record received" timestamp shared between the read loop and the watchdog.
///
/// Stored as microseconds since creation; updates never move it backwards.
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_micros: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_micros: AtomicU64::new(0),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        let now = self.origin.elapsed().as_micros() as u64;
        self.last_micros.fetch_max(now, Ordering::AcqRel);
    }

    /// Time since the last recorded activity.
    pub fn idle(&self) -> Duration {
        let last = Duration::from_micros(self.last_micros.load(Ordering::Acquire));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental splitter for multi-byte delimiters.
///
/// Records keep their trailing delimiter.
#[derive(Debug)]
pub struct RecordSplitter {
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    scanned: usize,
}

impl RecordSplitter {
    pub fn new(delimiter: impl Into<Vec<u8>>) -> Self {
        Self {
            delimiter: delimiter.into(),
            buf: Vec::new(),
            scanned: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete record, if the buffer holds one.
    pub fn next_record(&mut self) -> Option<Vec<u8>> {
        let len = self.delimiter.len();
        if len == 0 {
            return (!self.buf.is_empty()).then(|| std::mem::take(&mut self.buf));
        }

        let found = self.buf[self.scanned..]
            .windows(len)
            .position(|window| window == self.delimiter.as_slice());

        match found {
            Some(offset) => {
                let end = self.scanned + offset + len;
                let record: Vec<u8> = self.buf.drain(..end).collect();
                self.scanned = 0;
                Some(record)
            }
            None => {
                // A delimiter may straddle the next chunk.
                self.scanned = self.buf.len().saturating_sub(len - 1);
                None
            }
        }
    }

    /// Whatever is left at end of stream, without a delimiter.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.scanned = 0;
        (!self.buf.is_empty()).then(|| std::mem::take(&mut self.buf))
    }
}

/// Reads delimiter-separated records from `inner`, enforcing an inactivity timeout.
pub struct LineTimeoutReader<R> {
    inner: R,
    delimiter: Vec<u8>,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl<R: AsyncRead + Unpin> LineTimeoutReader<R> {
    /// A reader with no timeout.
    pub fn new(inner: R, delimiter: impl Into<Vec<u8>>) -> Self {
        Self {
            inner,
            delimiter: delimiter.into(),
            timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// `None` (or a zero duration) disables the watchdog.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Invoke `on_record` for every record until end of stream.
    ///
    /// The activity clock is updated before `on_record` runs, so time spent in
    /// the callback counts against the next record, not the current one.
    /// Timeout detection latency is the timeout plus up to one poll interval.
    pub async fn for_each_record<F>(&mut self, mut on_record: F) -> Result<(), ReaderError>
    where
        F: FnMut(&[u8]),
    {
        let Some(timeout) = self.timeout else {
            return read_records(&mut self.inner, &self.delimiter, None, &mut on_record).await;
        };

        let clock = ActivityClock::new();
        tokio::select! {
            biased;
            result = read_records(&mut self.inner, &self.delimiter, Some(&clock), &mut on_record) => result,
            idle = watch_inactivity(&clock, timeout, self.poll_interval) => {
                tracing::debug!(idle_ms = idle.as_millis() as u64, "inactivity watchdog fired");
                Err(ReaderError::TimedOut { idle, timeout })
            }
        }
    }
}

async fn read_records<R, F>(
    reader: &mut R,
    delimiter: &[u8],
    clock: Option<&ActivityClock>,
    on_record: &mut F,
) -> Result<(), ReaderError>
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut splitter = RecordSplitter::new(delimiter);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|source| ReaderError::Io { source })?;

        if n == 0 {
            if let Some(rest) = splitter.finish() {
                if let Some(clock) = clock {
                    clock.touch();
                }
                on_record(&rest);
            }
            return Ok(());
        }

        splitter.push(&chunk[..n]);
        while let Some(record) = splitter.next_record() {
            if let Some(clock) = clock {
                clock.touch();
            }
            on_record(&record);
        }
    }
}

/// Resolves once the clock has been idle for longer than `timeout`.
async fn watch_inactivity(clock: &ActivityClock, timeout: Duration, poll_interval: Duration) -> Duration {
    loop {
        tokio::time::sleep(poll_interval).await;
        let idle = clock.idle();
        if idle > timeout {
            return idle;
        }
    }
}
