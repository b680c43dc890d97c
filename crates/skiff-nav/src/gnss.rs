use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, ErrorKind};
use std::time::Duration;
use tracing::{debug, info};

use crate::sensor::{SensorCell, SensorWorker, StopFlag};
use crate::GnssConfig;

/// Latest GPS state as accumulated from NMEA sentences.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpsReading {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_knots: Option<f64>,
    /// Course over ground, degrees true.
    pub course: Option<f64>,
    pub satellites: Option<u32>,
    /// GGA quality indicator; 0 means no fix.
    pub fix_quality: Option<u8>,
    /// The receiver is open and being read.
    pub running: bool,
}

impl GpsReading {
    pub fn has_fix(&self) -> bool {
        self.fix_quality.is_some_and(|q| q > 0) && self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Fold one NMEA sentence into `reading`. Returns true when the sentence was
/// recognized and valid. GGA supplies fix quality and satellites, RMC and VTG
/// supply speed and course; both GGA and RMC carry position.
pub fn apply_sentence(reading: &mut GpsReading, line: &str) -> bool {
    let Some(body) = checked_body(line.trim()) else { return false };
    let f: Vec<&str> = body.split(',').collect();
    let Some(kind) = f[0].get(2..) else { return false };

    match kind {
        "GGA" if f.len() > 7 => {
            if let Some((lat, lon)) = position(f[2], f[3], f[4], f[5]) {
                reading.latitude = Some(lat);
                reading.longitude = Some(lon);
            }
            reading.fix_quality = f[6].parse().ok();
            reading.satellites = f[7].parse().ok();
            true
        }
        "RMC" if f.len() > 8 => {
            if f[2] == "A" {
                if let Some((lat, lon)) = position(f[3], f[4], f[5], f[6]) {
                    reading.latitude = Some(lat);
                    reading.longitude = Some(lon);
                }
            }
            if let Ok(kn) = f[7].parse() {
                reading.speed_knots = Some(kn);
            }
            if let Ok(course) = f[8].parse() {
                reading.course = Some(course);
            }
            true
        }
        "VTG" if f.len() > 5 => {
            if let Ok(course) = f[1].parse() {
                reading.course = Some(course);
            }
            if let Ok(kn) = f[5].parse() {
                reading.speed_knots = Some(kn);
            }
            true
        }
        _ => false,
    }
}

/// Strip `$` and the optional `*hh` checksum, rejecting sentences whose
/// checksum does not match.
fn checked_body(s: &str) -> Option<&str> {
    let s = s.strip_prefix('$')?;
    match s.split_once('*') {
        Some((body, sum)) => {
            let want = u8::from_str_radix(sum.get(..2)?, 16).ok()?;
            let got = body.bytes().fold(0u8, |acc, b| acc ^ b);
            (want == got).then_some(body)
        }
        None => Some(s),
    }
}

fn position(lat: &str, ns: &str, lon: &str, ew: &str) -> Option<(f64, f64)> {
    Some((parse_deg_min(lat, ns, 2)?, parse_deg_min(lon, ew, 3)?))
}

// lat: ddmm.mmmm, lon: dddmm.mmmm
fn parse_deg_min(v: &str, hemi: &str, deg_len: usize) -> Option<f64> {
    if v.len() <= deg_len {
        return None;
    }
    let deg: f64 = v[..deg_len].parse().ok()?;
    let min: f64 = v[deg_len..].parse().ok()?;
    let out = deg + min / 60.0;
    match hemi {
        "N" | "E" => Some(out),
        "S" | "W" => Some(-out),
        _ => None,
    }
}

pub enum GnssSource {
    Serial(BufReader<Box<dyn tokio_serial::SerialPort>>),
    /// Replays a captured NMEA log, looping at EOF.
    File { path: String, reader: BufReader<std::fs::File> },
}

impl GnssSource {
    pub fn serial(dev: &str, baud: u32) -> Result<Self> {
        let port = tokio_serial::new(dev, baud)
            .timeout(Duration::from_secs(1))
            .open()
            .with_context(|| format!("open serial {}", dev))?;
        Ok(Self::Serial(BufReader::new(port)))
    }

    pub fn file(path: &str) -> Result<Self> {
        let f = std::fs::File::open(path).with_context(|| format!("open nmea file {}", path))?;
        Ok(Self::File { path: path.to_string(), reader: BufReader::new(f) })
    }

    /// Append bytes up to and including the next newline. Returns false on a
    /// read timeout or EOF with nothing complete yet.
    fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        let res = match self {
            GnssSource::Serial(r) => r.read_until(b'\n', buf),
            GnssSource::File { path, reader } => {
                let n = reader.read_until(b'\n', buf)?;
                if n == 0 {
                    let f = std::fs::File::open(&*path).with_context(|| format!("reopen nmea file {}", path))?;
                    *reader = BufReader::new(f);
                    std::thread::sleep(Duration::from_millis(500));
                }
                Ok(n)
            }
        };
        match res {
            Ok(_) => Ok(buf.last() == Some(&b'\n')),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e).context("gnss read"),
        }
    }
}

fn open_source(cfg: &GnssConfig) -> Result<GnssSource> {
    match cfg.source.as_str() {
        "file" => {
            let path = cfg.nmea_file.as_deref().context("gnss.source = \"file\" needs gnss.nmea_file")?;
            GnssSource::file(path)
        }
        _ => GnssSource::serial(&cfg.serial_dev, cfg.baud),
    }
}

/// Start the NMEA reader thread. The receiver is (re)opened inside the
/// worker, so a missing device shows up as `running == false` rather than
/// an error here.
pub fn spawn_reader(cfg: &GnssConfig) -> Result<(SensorCell<GpsReading>, SensorWorker)> {
    let cell = SensorCell::new(GpsReading::default());
    let writer = cell.clone();
    let cfg = cfg.clone();
    let mut source: Option<GnssSource> = None;
    let mut line = Vec::new();

    let worker = SensorWorker::spawn("gnss", Duration::from_secs(5), move |_stop: &StopFlag| {
        if source.is_none() {
            source = Some(open_source(&cfg)?);
            info!("gnss: reading NMEA from {}", describe(&cfg));
            writer.update(|r| r.running = true);
        }
        let Some(src) = source.as_mut() else { return Ok(()) };
        match src.read_line(&mut line) {
            Ok(true) => {
                let text = String::from_utf8_lossy(&line);
                writer.update(|r| {
                    if !apply_sentence(r, &text) {
                        debug!("gnss: skipped {}", text.trim());
                    }
                });
                line.clear();
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                source = None;
                line.clear();
                writer.update(|r| r.running = false);
                Err(e)
            }
        }
    })?;
    Ok((cell, worker))
}

fn describe(cfg: &GnssConfig) -> String {
    match (cfg.source.as_str(), &cfg.nmea_file) {
        ("file", Some(p)) => format!("file {}", p),
        _ => format!("{} @ {} baud", cfg.serial_dev, cfg.baud),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_sentences(text: &str, reading: &mut GpsReading) -> usize {
        text.lines().filter(|l| apply_sentence(reading, l)).count()
    }

    const CAPTURE: &str = "\
$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47
$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A
$GPVTG,054.7,T,034.4,M,005.5,N,010.2,K*48
$GPGSA,A,3,04,05,,09,12,,,24,,,,,2.5,1.3,2.1*39
";

    #[test]
    fn capture_builds_a_fix() {
        let mut r = GpsReading::default();
        assert_eq!(drain_sentences(CAPTURE, &mut r), 3);
        assert!(r.has_fix());
        assert_eq!(r.satellites, Some(8));
        assert_eq!(r.fix_quality, Some(1));
        assert!((r.latitude.unwrap() - 48.1173).abs() < 1e-4);
        assert!((r.longitude.unwrap() - 11.516_666).abs() < 1e-4);
        // VTG came last
        assert_eq!(r.speed_knots, Some(5.5));
        assert_eq!(r.course, Some(54.7));
    }

    #[test]
    fn southern_and_western_hemispheres_are_negative() {
        let mut r = GpsReading::default();
        assert!(apply_sentence(&mut r, "$GNRMC,010203,A,3746.494,S,12225.164,W,1.0,90.0,010125,,"));
        assert!(r.latitude.unwrap() < 0.0);
        assert!(r.longitude.unwrap() < 0.0);
    }

    #[test]
    fn bad_checksum_and_void_rmc_leave_position_alone() {
        let mut r = GpsReading::default();
        assert!(!apply_sentence(&mut r, "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*00"));
        assert!(apply_sentence(&mut r, "$GPRMC,123519,V,4807.038,N,01131.000,E,0.0,,230394,,"));
        assert_eq!(r.latitude, None);
        assert!(!r.has_fix());
    }

    #[test]
    fn no_fix_quality_means_no_fix() {
        let mut r = GpsReading::default();
        apply_sentence(&mut r, "$GPGGA,123519,,,,,0,00,,,M,,M,,");
        assert_eq!(r.fix_quality, Some(0));
        assert!(!r.has_fix());
    }
}
