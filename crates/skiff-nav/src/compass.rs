use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::time::Duration;
use tracing::{info, warn};

use crate::sensor::{SensorCell, SensorWorker, StopFlag};
use crate::CompassConfig;

const CHIP_ID_REG: u8 = 0x40;
const DATA_X_LSB: u8 = 0x42;
const POWER_CONTROL_REG: u8 = 0x4B;
const OP_MODE_REG: u8 = 0x4C;
const CHIP_ID: u8 = 0x32;

// linux/i2c-dev.h
const I2C_SLAVE: libc::c_ulong = 0x0703;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompassReading {
    /// Degrees true, [0, 360).
    pub heading: f64,
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Calibration {
    pub offset_x: f64,
    pub offset_y: f64,
    pub declination_deg: f64,
}

/// Byte-register access to one device on a bus.
pub trait RegisterBus: Send {
    fn read_regs(&mut self, reg: u8, buf: &mut [u8]) -> std::io::Result<()>;
    fn write_reg(&mut self, reg: u8, value: u8) -> std::io::Result<()>;
}

/// `/dev/i2c-N` bound to a single slave address.
pub struct I2cDev {
    file: File,
}

impl I2cDev {
    pub fn open(bus: u32, address: u16) -> Result<Self> {
        let path = format!("/dev/i2c-{}", bus);
        let file = OpenOptions::new().read(true).write(true).open(&path).with_context(|| format!("open {}", path))?;
        // SAFETY: fd is owned by `file` for the duration of the call; I2C_SLAVE takes the address by value.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), I2C_SLAVE as _, address as libc::c_ulong) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| format!("select i2c address {:#04x}", address));
        }
        Ok(Self { file })
    }
}

impl RegisterBus for I2cDev {
    fn read_regs(&mut self, reg: u8, buf: &mut [u8]) -> std::io::Result<()> {
        self.file.write_all(&[reg])?;
        self.file.read_exact(buf)
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> std::io::Result<()> {
        self.file.write_all(&[reg, value])
    }
}

pub struct Bmm150<B> {
    bus: B,
    cal: Calibration,
}

impl<B: RegisterBus> Bmm150<B> {
    /// Verify the chip id, power the sensor up and select normal mode.
    pub fn init(mut bus: B, cal: Calibration) -> Result<Self> {
        let mut id = [0u8];
        bus.read_regs(CHIP_ID_REG, &mut id).context("read chip id")?;
        anyhow::ensure!(id[0] == CHIP_ID, "unexpected BMM150 chip id {:#04x}, expected {:#04x}", id[0], CHIP_ID);
        bus.write_reg(POWER_CONTROL_REG, 0x01).context("power up")?;
        std::thread::sleep(Duration::from_millis(100));
        bus.write_reg(OP_MODE_REG, 0x00).context("normal mode")?;
        std::thread::sleep(Duration::from_millis(100));
        Ok(Self { bus, cal })
    }

    pub fn read(&mut self) -> Result<CompassReading> {
        let mut raw = [0u8; 6];
        self.bus.read_regs(DATA_X_LSB, &mut raw).context("read axes")?;
        let (x, y, z) = decode_axes(&raw);
        Ok(CompassReading { heading: heading_deg(x, y, &self.cal), x, y, z, connected: true })
    }

    /// Put the sensor back into suspend mode.
    pub fn sleep(&mut self) -> Result<()> {
        self.bus.write_reg(POWER_CONTROL_REG, 0x00).context("suspend")?;
        Ok(())
    }
}

/// x and y are 13-bit, z 15-bit, left-aligned two's complement.
pub fn decode_axes(raw: &[u8; 6]) -> (i16, i16, i16) {
    let x = i16::from_le_bytes([raw[0], raw[1]]) >> 3;
    let y = i16::from_le_bytes([raw[2], raw[3]]) >> 3;
    let z = i16::from_le_bytes([raw[4], raw[5]]) >> 1;
    (x, y, z)
}

pub fn heading_deg(x: i16, y: i16, cal: &Calibration) -> f64 {
    let hx = x as f64 - cal.offset_x;
    let hy = y as f64 - cal.offset_y;
    (hy.atan2(hx).to_degrees() + cal.declination_deg).rem_euclid(360.0)
}

/// Start the compass polling thread. An absent or failing chip leaves the
/// reading with `connected == false` and is retried in the background.
pub fn spawn_reader(cfg: &CompassConfig) -> Result<(SensorCell<CompassReading>, SensorWorker)> {
    let cell = SensorCell::new(CompassReading::default());
    let writer = cell.clone();
    let cfg = cfg.clone();
    let cal = cfg.calibration();
    let period = Duration::from_millis(cfg.poll_ms.max(10));
    let mut chip: Option<Bmm150<I2cDev>> = None;

    let worker = SensorWorker::spawn("compass", Duration::from_secs(5), move |stop: &StopFlag| {
        if chip.is_none() {
            let dev = I2cDev::open(cfg.i2c_bus, cfg.address)?;
            chip = Some(Bmm150::init(dev, cal)?);
            info!("compass: BMM150 ready on i2c-{} @ {:#04x}", cfg.i2c_bus, cfg.address);
        }
        let Some(dev) = chip.as_mut() else { return Ok(()) };
        match dev.read() {
            Ok(reading) => writer.publish(reading),
            Err(e) => {
                chip = None;
                writer.update(|r| r.connected = false);
                return Err(e);
            }
        }
        stop.nap(period);
        if stop.is_set() {
            if let Some(dev) = chip.as_mut() {
                if let Err(e) = dev.sleep() {
                    warn!("compass: {:#}", e);
                }
            }
        }
        Ok(())
    })?;
    Ok((cell, worker))
}
