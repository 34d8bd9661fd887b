//! The host interface: everything the VM needs from the outside world.
//!
//! The VM consumes a [`Host`] for standard input/output, the clock and
//! the file system, plus an optional [`Hal`] seam for screen and sound.
//! [`StdHost`] wires the trait to the real process environment;
//! [`ScriptedHost`] replays a scripted stdin transcript and captures
//! stdout, which is what makes runs byte-for-byte reproducible in
//! tests.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use qbc_emit::OpenMode;
use rustc_hash::FxHashMap;

/// Optional screen/sound entry points. Absent in the core; a host that
/// returns `None` from [`Host::hal`] makes `SLEEP` fail with
/// `FeatureUnavailable` while `CLS` and `BEEP` degrade to no-ops.
pub trait Hal {
    fn cls(&mut self);
    fn beep(&mut self);
    fn sleep(&mut self, seconds: f64);
}

/// The minimal host object.
pub trait Host {
    /// Read one line from standard input, without the terminator.
    /// `None` means end of input.
    fn stdin_readline(&mut self) -> io::Result<Option<String>>;

    fn stdout_write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Seconds since midnight, for `TIMER`.
    fn now_ticks(&self) -> f64;

    fn open(&mut self, path: &str, mode: OpenMode) -> io::Result<u64>;
    fn read(&mut self, handle: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, handle: u64, buf: &[u8]) -> io::Result<usize>;
    fn seek(&mut self, handle: u64, pos: u64) -> io::Result<u64>;
    fn close(&mut self, handle: u64) -> io::Result<()>;

    fn hal(&mut self) -> Option<&mut dyn Hal> {
        None
    }
}

/// Host over the real process environment.
#[derive(Default)]
pub struct StdHost {
    files: FxHashMap<u64, File>,
    next_handle: u64,
}

impl StdHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn file(&mut self, handle: u64) -> io::Result<&mut File> {
        self.files
            .get_mut(&handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "bad file handle"))
    }
}

impl Host for StdHost {
    fn stdin_readline(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let n = io::stdin().lock().read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    fn stdout_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(bytes)?;
        out.flush()
    }

    fn now_ticks(&self) -> f64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (now.as_secs_f64()) % 86_400.0
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> io::Result<u64> {
        let file = match mode {
            OpenMode::Input => OpenOptions::new().read(true).open(path)?,
            OpenMode::Output => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
            OpenMode::Append => OpenOptions::new().append(true).create(true).open(path)?,
            OpenMode::Binary | OpenMode::Random => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?,
        };
        self.next_handle += 1;
        self.files.insert(self.next_handle, file);
        Ok(self.next_handle)
    }

    fn read(&mut self, handle: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file(handle)?.read(buf)
    }

    fn write(&mut self, handle: u64, buf: &[u8]) -> io::Result<usize> {
        self.file(handle)?.write(buf)
    }

    fn seek(&mut self, handle: u64, pos: u64) -> io::Result<u64> {
        self.file(handle)?.seek(SeekFrom::Start(pos))
    }

    fn close(&mut self, handle: u64) -> io::Result<()> {
        self.files.remove(&handle);
        Ok(())
    }
}

/// Deterministic in-memory host for tests and transcript replay.
pub struct ScriptedHost {
    input: Vec<String>,
    input_pos: usize,
    pub output: Vec<u8>,
    /// In-memory file system: path → content.
    pub files: FxHashMap<String, Vec<u8>>,
    open_files: FxHashMap<u64, ScriptedFile>,
    next_handle: u64,
    pub ticks: f64,
}

struct ScriptedFile {
    path: String,
    pos: usize,
    mode: OpenMode,
}

impl ScriptedHost {
    pub fn new(input_lines: &[&str]) -> Self {
        Self {
            input: input_lines.iter().map(|s| s.to_string()).collect(),
            input_pos: 0,
            output: Vec::new(),
            files: FxHashMap::default(),
            open_files: FxHashMap::default(),
            next_handle: 0,
            ticks: 0.0,
        }
    }

    pub fn output_str(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

impl Host for ScriptedHost {
    fn stdin_readline(&mut self) -> io::Result<Option<String>> {
        match self.input.get(self.input_pos) {
            Some(line) => {
                self.input_pos += 1;
                Ok(Some(line.clone()))
            }
            None => Ok(None),
        }
    }

    fn stdout_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.output.extend_from_slice(bytes);
        Ok(())
    }

    fn now_ticks(&self) -> f64 {
        self.ticks
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> io::Result<u64> {
        match mode {
            OpenMode::Input => {
                if !self.files.contains_key(path) {
                    return Err(io::Error::new(io::ErrorKind::NotFound, "file not found"));
                }
            }
            OpenMode::Output => {
                self.files.insert(path.to_string(), Vec::new());
            }
            OpenMode::Append | OpenMode::Binary | OpenMode::Random => {
                self.files.entry(path.to_string()).or_default();
            }
        }
        self.next_handle += 1;
        let pos = match mode {
            OpenMode::Append => self.files[path].len(),
            _ => 0,
        };
        self.open_files.insert(
            self.next_handle,
            ScriptedFile {
                path: path.to_string(),
                pos,
                mode,
            },
        );
        Ok(self.next_handle)
    }

    fn read(&mut self, handle: u64, buf: &mut [u8]) -> io::Result<usize> {
        let file = self
            .open_files
            .get_mut(&handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "bad file handle"))?;
        let content = &self.files[&file.path];
        let n = buf.len().min(content.len().saturating_sub(file.pos));
        buf[..n].copy_from_slice(&content[file.pos..file.pos + n]);
        file.pos += n;
        Ok(n)
    }

    fn write(&mut self, handle: u64, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .open_files
            .get_mut(&handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "bad file handle"))?;
        let content = self.files.get_mut(&file.path).unwrap();
        match file.mode {
            OpenMode::Append => content.extend_from_slice(buf),
            _ => {
                if file.pos < content.len() {
                    content.truncate(file.pos);
                }
                content.extend_from_slice(buf);
            }
        }
        file.pos = content.len();
        Ok(buf.len())
    }

    fn seek(&mut self, handle: u64, pos: u64) -> io::Result<u64> {
        let file = self
            .open_files
            .get_mut(&handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "bad file handle"))?;
        file.pos = pos as usize;
        Ok(pos)
    }

    fn close(&mut self, handle: u64) -> io::Result<()> {
        self.open_files.remove(&handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_host_replays_input() {
        let mut host = ScriptedHost::new(&["10", "hello"]);
        assert_eq!(host.stdin_readline().unwrap(), Some("10".to_string()));
        assert_eq!(host.stdin_readline().unwrap(), Some("hello".to_string()));
        assert_eq!(host.stdin_readline().unwrap(), None);
    }

    #[test]
    fn test_scripted_host_captures_output() {
        let mut host = ScriptedHost::new(&[]);
        host.stdout_write(b"A\n").unwrap();
        host.stdout_write(b"B").unwrap();
        assert_eq!(host.output_str(), "A\nB");
    }

    #[test]
    fn test_scripted_file_round_trip() {
        let mut host = ScriptedHost::new(&[]);
        let h = host.open("out.txt", OpenMode::Output).unwrap();
        host.write(h, b"line\n").unwrap();
        host.close(h).unwrap();

        let h = host.open("out.txt", OpenMode::Input).unwrap();
        let mut buf = [0u8; 16];
        let n = host.read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"line\n");
    }

    #[test]
    fn test_scripted_open_missing_input_fails() {
        let mut host = ScriptedHost::new(&[]);
        assert!(host.open("missing.txt", OpenMode::Input).is_err());
    }

    #[test]
    fn test_append_positions_at_end() {
        let mut host = ScriptedHost::new(&[]);
        host.files.insert("log.txt".into(), b"old".to_vec());
        let h = host.open("log.txt", OpenMode::Append).unwrap();
        host.write(h, b"+new").unwrap();
        assert_eq!(host.files["log.txt"], b"old+new");
    }
}
