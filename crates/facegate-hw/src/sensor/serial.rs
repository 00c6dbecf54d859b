//! UART transport: a raw-mode tty with a bounded read timeout.

use super::SensorLink;
use nix::sys::termios::{self, BaudRate, FlushArg, SetArg, SpecialCharacterIndices};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;

/// Read timeout in deciseconds (termios VTIME units).
const READ_TIMEOUT_DS: u8 = 10;

fn baud_rate(baud: u32) -> io::Result<BaudRate> {
    Ok(match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {other}"),
            ))
        }
    })
}

/// Raw tty carrying the sensor protocol.
pub struct SerialLink {
    file: File,
}

impl SerialLink {
    pub fn open(port: &str, baud: u32) -> io::Result<Self> {
        Ok(Self {
            file: open(port, baud)?,
        })
    }
}

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl SensorLink for SerialLink {
    fn discard_input(&mut self) -> io::Result<()> {
        termios::tcflush(&self.file, FlushArg::TCIFLUSH)?;
        Ok(())
    }
}

/// Open `port` as a raw 8N1 line at `baud`.
fn open(port: &str, baud: u32) -> io::Result<File> {
    let speed = baud_rate(baud)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(port)?;

    let mut tio = termios::tcgetattr(&file)?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, speed)?;
    // Return whatever arrived after at most READ_TIMEOUT_DS; an empty read
    // surfaces as UnexpectedEof from read_exact.
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = READ_TIMEOUT_DS;
    termios::tcsetattr(&file, SetArg::TCSANOW, &tio)?;
    termios::tcflush(&file, FlushArg::TCIOFLUSH)?;

    tracing::info!(port, baud, "serial sensor link open");
    Ok(file)
}
