//! Line-oriented scanning of a child's output stream.
//!
//! Grounded in `examples/original_source/process/scanner.go:ScanInto`. The
//! original manually chains `bufio.Reader.ReadLine()` results together with a
//! doubling-capacity buffer to handle arbitrarily long lines without ever
//! truncating; `std::io::BufRead::read_until` already grows its buffer the
//! same way internally, so the port leans on that instead of reimplementing
//! the manual prefix-chaining loop — same guarantee, less code.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread::JoinHandle;

pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type LineFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type LineProcessor = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// The four optional hooks a `LineScanner` runs per line, applied in this
/// order: `pre_processor` (sync) → `callback_filter`-gated `callback`
/// (async, tracked) → `post_processor` (sync) → write to the sink.
#[derive(Clone, Default)]
pub struct LineScannerConfig {
    pub pre_processor: Option<LineProcessor>,
    pub callback_filter: Option<LineFilter>,
    pub callback: Option<LineCallback>,
    pub post_processor: Option<LineProcessor>,
}

/// Read lines from `reader`, run them through `config`'s hooks, and write
/// each finalized line (with a trailing `\n`) to `sink`.
///
/// Every line that passes the callback filter spawns its callback on its own
/// thread; all such threads are joined before this function returns, so a
/// caller observing EOF has also observed every callback complete.
pub fn scan_into<R, W>(config: &LineScannerConfig, reader: R, sink: &mut W) -> io::Result<()>
where
    R: io::Read,
    W: Write,
{
    let mut buffered = io::BufReader::new(reader);
    let mut callback_threads: Vec<JoinHandle<()>> = Vec::new();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        buf.clear();
        let n = buffered.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        let mut line = String::from_utf8_lossy(&buf).into_owned();

        if let Some(pre) = &config.pre_processor {
            line = pre(&line);
        }

        if let (Some(filter), Some(callback)) = (&config.callback_filter, &config.callback) {
            if filter(&line) {
                let callback = Arc::clone(callback);
                let line_for_thread = line.clone();
                callback_threads.push(std::thread::spawn(move || callback(&line_for_thread)));
            }
        }

        if let Some(post) = &config.post_processor {
            line = post(&line);
        }

        sink.write_all(line.as_bytes())?;
        sink.write_all(b"\n")?;
    }

    for handle in callback_threads {
        // A panicking callback thread shouldn't take the whole scan down;
        // it's already been logged by the default panic hook.
        let _ = handle.join();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn lines_pass_through_unmodified_with_no_hooks() {
        let input = b"one\ntwo\nthree".to_vec();
        let mut out = Vec::new();
        scan_into(&LineScannerConfig::default(), input.as_slice(), &mut out).unwrap();
        assert_eq!(out, b"one\ntwo\nthree\n");
    }

    #[test]
    fn pre_and_post_processors_apply_in_order() {
        let config = LineScannerConfig {
            pre_processor: Some(Arc::new(|s: &str| format!("[{s}]"))),
            post_processor: Some(Arc::new(|s: &str| s.to_uppercase())),
            ..Default::default()
        };
        let mut out = Vec::new();
        scan_into(&config, b"hi".as_slice(), &mut out).unwrap();
        assert_eq!(out, b"[HI]\n");
    }

    #[test]
    fn callback_runs_only_when_filter_passes_and_is_awaited() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let config = LineScannerConfig {
            callback_filter: Some(Arc::new(|s: &str| s.starts_with("keep"))),
            callback: Some(Arc::new(move |s: &str| seen_cb.lock().push(s.to_string()))),
            ..Default::default()
        };
        let mut out = Vec::new();
        scan_into(&config, b"keep-this\nskip-this\n".as_slice(), &mut out).unwrap();
        assert_eq!(*seen.lock(), vec!["keep-this".to_string()]);
    }

    #[test]
    fn very_long_line_is_not_truncated() {
        let long_line = "x".repeat(200_000);
        let mut input = long_line.clone().into_bytes();
        input.push(b'\n');
        let mut out = Vec::new();
        scan_into(&LineScannerConfig::default(), input.as_slice(), &mut out).unwrap();
        assert_eq!(out.len(), long_line.len() + 1);
    }
}
