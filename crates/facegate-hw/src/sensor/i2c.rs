//! I2C transport: `/dev/i2c-N` bound to the sensor's slave address.

use super::SensorLink;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

/// `I2C_SLAVE` from `<linux/i2c-dev.h>`.
const I2C_SLAVE: libc::c_ulong = 0x0703;

/// Bus device bound to the sensor's address.
pub struct I2cLink {
    file: File,
}

impl I2cLink {
    pub fn open(bus: &str, address: u16) -> io::Result<Self> {
        Ok(Self {
            file: open(bus, address)?,
        })
    }
}

impl Read for I2cLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for I2cLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl SensorLink for I2cLink {
    /// Reads are master-clocked, so nothing is buffered on the host side;
    /// the sensor replaces its unread reply when the next request arrives.
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Open an I2C bus device and bind all further reads/writes to `address`.
fn open(bus: &str, address: u16) -> io::Result<File> {
    let file = OpenOptions::new().read(true).write(true).open(bus)?;

    // SAFETY: fd is valid for the lifetime of `file`; I2C_SLAVE takes the
    // 7-bit address by value.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), I2C_SLAVE, libc::c_ulong::from(address)) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    tracing::info!(bus, address = format_args!("{address:#04x}"), "I2C sensor link open");
    Ok(file)
}
