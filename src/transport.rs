//! Raw serial transport. The port is opened in raw mode with a zero read
//! timeout, so a read returns whatever happens to be buffered (possibly
//! nothing); all pacing lives in the session layer.

use std::fs::OpenOptions;
use std::path::Path;

use log::debug;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, SetArg, SpecialCharacterIndices,
};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open serial device {path}: {source}")]
    DeviceUnavailable {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to configure serial device: {0}")]
    ConfigFailed(#[from] nix::Error),
    #[error("serial I/O failed: {0}")]
    IoFailed(#[from] std::io::Error),
    #[error("baud rate {0} is not supported on this platform")]
    UnsupportedBaudRate(u32),
}

/// Serial speeds the MTK loggers are known to talk at, slowest first.
pub const PORT_SPEEDS: [u32; 8] = [1200, 4800, 9600, 14400, 19200, 38400, 57600, 115200];

fn baud_constant(speed: u32) -> Result<BaudRate, TransportError> {
    match speed {
        1200 => Ok(BaudRate::B1200),
        4800 => Ok(BaudRate::B4800),
        9600 => Ok(BaudRate::B9600),
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        14400 => Ok(BaudRate::B14400),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        other => Err(TransportError::UnsupportedBaudRate(other)),
    }
}

/// Byte-level port access, factored as a trait so the session layer can be
/// driven by a scripted stub in tests.
pub trait Transport {
    fn write_all(
        &mut self,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn read_available(
        &mut self,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<usize, TransportError>> + Send;
}

#[derive(Debug)]
pub struct SerialPort {
    file: File,
    path: String,
}

impl SerialPort {
    /// Open `path` raw at `speed` with VMIN=0/VTIME=0 so reads never block.
    pub fn open(path: &Path, speed: u32) -> Result<Self, TransportError> {
        let baud = baud_constant(speed)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| TransportError::DeviceUnavailable {
                path: path.display().to_string(),
                source,
            })?;

        let mut tios = termios::tcgetattr(&file)?;
        termios::cfmakeraw(&mut tios);
        tios.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
        tios.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::cfsetispeed(&mut tios, baud)?;
        termios::cfsetospeed(&mut tios, baud)?;
        termios::tcsetattr(&file, SetArg::TCSANOW, &tios)?;
        termios::tcflush(&file, FlushArg::TCIOFLUSH)?;

        debug!("opened {} at {speed} baud", path.display());
        Ok(SerialPort {
            file: File::from_std(file),
            path: path.display().to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transport for SerialPort {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.file.write_all(bytes).await?;
        self.file.flush().await?;
        Ok(())
    }

    async fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.file.read(buf).await {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(TransportError::IoFailed(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_baud() {
        assert!(matches!(
            baud_constant(31337),
            Err(TransportError::UnsupportedBaudRate(31337))
        ));
    }

    #[test]
    fn test_open_missing_device() {
        let err = SerialPort::open(Path::new("/dev/does-not-exist"), 115200).unwrap_err();
        assert!(matches!(err, TransportError::DeviceUnavailable { .. }));
    }
}
