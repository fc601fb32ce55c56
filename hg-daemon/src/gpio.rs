//! Wiegand data lines via sysfs GPIO
//!
//! Both lines idle high; each bit is a short low pulse on DATA0 (a zero) or
//! DATA1 (a one). The lines are configured for falling-edge interrupts and a
//! dedicated thread blocks in `poll(2)` on their `value` files, feeding every
//! edge into the decoder. The decoder is the only thing shared with the main
//! loop.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use hg_core::{GpioConfig, WiegandDecoder};
use hg_error::{HelmgateError, Result};

/// How long `poll(2)` blocks before re-checking the shutdown flag
const POLL_TIMEOUT_MS: i32 = 100;

/// Attempts to wait for udev to hand over a freshly exported line
const EXPORT_SETTLE_TRIES: u32 = 20;

/// One exported input line with edge interrupts enabled
pub struct EdgeLine {
    number: u32,
    value: File,
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|source| HelmgateError::FileWrite { path: path.to_path_buf(), source })
}

pub fn line_dir(base: &Path, number: u32) -> PathBuf {
    base.join(format!("gpio{}", number))
}

impl EdgeLine {
    /// Export `number` if needed and arm it for falling edges
    pub fn open(base: &Path, number: u32) -> Result<Self> {
        let dir = line_dir(base, number);
        if !dir.exists() {
            // EBUSY here means someone else exported it first
            if let Err(e) = write_attr(&base.join("export"), &number.to_string()) {
                debug!(line = number, error = %e, "Export failed, checking for the line anyway");
            }
            let mut tries = 0;
            while !dir.join("edge").exists() && tries < EXPORT_SETTLE_TRIES {
                thread::sleep(Duration::from_millis(50));
                tries += 1;
            }
        }
        if !dir.exists() {
            return Err(HelmgateError::ResourceMissing(format!("GPIO line {}", number)));
        }

        write_attr(&dir.join("direction"), "in")?;
        write_attr(&dir.join("edge"), "falling")?;

        let value_path = dir.join("value");
        let value = OpenOptions::new()
            .read(true)
            .open(&value_path)
            .map_err(|source| HelmgateError::FileRead { path: value_path, source })?;

        let mut line = Self { number, value };
        // Clear the interrupt pending from before we armed the line
        let _ = line.acknowledge();
        info!(line = number, "GPIO line armed for falling edges");
        Ok(line)
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// Re-read the value file, which re-arms the edge notification
    fn acknowledge(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        self.value.seek(SeekFrom::Start(0))?;
        let _ = self.value.read(&mut buf)?;
        Ok(())
    }
}

/// Open both data lines from the configuration
pub fn open_lines(config: &GpioConfig) -> Result<(EdgeLine, EdgeLine)> {
    let data0 = config
        .data0_line
        .ok_or_else(|| HelmgateError::MissingConfig("gpio.data0_line".into()))?;
    let data1 = config
        .data1_line
        .ok_or_else(|| HelmgateError::MissingConfig("gpio.data1_line".into()))?;
    if data0 == data1 {
        return Err(HelmgateError::invalid_config("gpio.data1_line", "must differ from gpio.data0_line"));
    }
    Ok((EdgeLine::open(&config.sysfs_base, data0)?, EdgeLine::open(&config.sysfs_base, data1)?))
}

/// Start the edge listener thread
pub fn spawn_listener(
    lines: (EdgeLine, EdgeLine),
    decoder: Arc<WiegandDecoder>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("wiegand-edges".into())
        .spawn(move || listen(lines, &decoder, &shutdown))
}

fn listen((mut data0, mut data1): (EdgeLine, EdgeLine), decoder: &WiegandDecoder, shutdown: &AtomicBool) {
    let mut fds = [
        libc::pollfd { fd: data0.value.as_raw_fd(), events: libc::POLLPRI | libc::POLLERR, revents: 0 },
        libc::pollfd { fd: data1.value.as_raw_fd(), events: libc::POLLPRI | libc::POLLERR, revents: 0 },
    ];

    while !shutdown.load(Ordering::Relaxed) {
        for fd in fds.iter_mut() {
            fd.revents = 0;
        }
        // SAFETY: `fds` is a valid array of initialized pollfd structs whose
        // descriptors stay open for the whole loop (owned by data0/data1).
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!(error = %err, "poll on GPIO lines failed");
                thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS as u64));
            }
            continue;
        }
        if ready == 0 {
            continue;
        }

        // Same poll round: DATA0 first, bits are never that close together
        if fds[0].revents & libc::POLLPRI != 0 {
            decoder.on_data0();
            let _ = data0.acknowledge();
        }
        if fds[1].revents & libc::POLLPRI != 0 {
            decoder.on_data1();
            let _ = data1.acknowledge();
        }
    }
    debug!("Edge listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_line(base: &Path, number: u32) {
        let dir = line_dir(base, number);
        fs::create_dir_all(&dir).unwrap();
        for attr in ["direction", "edge", "value"] {
            fs::write(dir.join(attr), "").unwrap();
        }
        fs::write(dir.join("value"), "1\n").unwrap();
    }

    #[test]
    fn test_open_arms_existing_line() {
        let dir = TempDir::new().unwrap();
        fake_line(dir.path(), 17);

        let line = EdgeLine::open(dir.path(), 17).unwrap();
        assert_eq!(line.number(), 17);
        let gpio = line_dir(dir.path(), 17);
        assert_eq!(fs::read_to_string(gpio.join("direction")).unwrap(), "in");
        assert_eq!(fs::read_to_string(gpio.join("edge")).unwrap(), "falling");
    }

    #[test]
    fn test_missing_line_is_resource_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("export"), "").unwrap();
        assert!(matches!(EdgeLine::open(dir.path(), 4), Err(HelmgateError::ResourceMissing(_))));
    }

    #[test]
    fn test_lines_must_be_configured_and_distinct() {
        let dir = TempDir::new().unwrap();
        fake_line(dir.path(), 17);
        fake_line(dir.path(), 27);

        let mut config = GpioConfig { sysfs_base: dir.path().to_path_buf(), data0_line: Some(17), data1_line: None };
        assert!(matches!(open_lines(&config), Err(HelmgateError::MissingConfig(_))));
        config.data1_line = Some(17);
        assert!(matches!(open_lines(&config), Err(HelmgateError::InvalidConfig { .. })));
        config.data1_line = Some(27);
        assert!(open_lines(&config).is_ok());
    }
}
