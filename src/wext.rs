//! Raw wireless-extension and socket ioctl surface.
//!
//! Everything unsafe in the crate is confined to this module: the
//! `repr(C)` request structures, the ioctl numbers, the scan-event
//! stream parser and the MII register reads used for wired link
//! probing. The typed per-device wrappers live in `radio`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::{c_char, c_ulong};

pub(crate) const IFNAMSIZ: usize = 16;

// Wireless-extension ioctl numbers.
pub(crate) const SIOCGIWNAME: c_ulong = 0x8B01;
pub(crate) const SIOCSIWFREQ: c_ulong = 0x8B04;
pub(crate) const SIOCGIWFREQ: c_ulong = 0x8B05;
pub(crate) const SIOCSIWMODE: c_ulong = 0x8B06;
pub(crate) const SIOCGIWMODE: c_ulong = 0x8B07;
pub(crate) const SIOCGIWRANGE: c_ulong = 0x8B0B;
pub(crate) const SIOCGIWSTATS: c_ulong = 0x8B0F;
pub(crate) const SIOCGIWAP: c_ulong = 0x8B15;
pub(crate) const SIOCSIWSCAN: c_ulong = 0x8B18;
pub(crate) const SIOCGIWSCAN: c_ulong = 0x8B19;
pub(crate) const SIOCSIWESSID: c_ulong = 0x8B1A;
pub(crate) const SIOCGIWESSID: c_ulong = 0x8B1B;
pub(crate) const SIOCSIWRATE: c_ulong = 0x8B20;
pub(crate) const SIOCGIWRATE: c_ulong = 0x8B21;
pub(crate) const SIOCSIWENCODE: c_ulong = 0x8B2A;
pub(crate) const SIOCGIWENCODE: c_ulong = 0x8B2B;

/// Quality event in a scan stream.
pub(crate) const IWEVQUAL: u16 = 0x8C01;

// Operating modes.
pub(crate) const IW_MODE_ADHOC: u32 = 1;
pub(crate) const IW_MODE_INFRA: u32 = 2;

// Encoding flags (iw_point.flags on SIOCSIWENCODE).
pub(crate) const IW_ENCODE_ENABLED: u16 = 0x0000;
pub(crate) const IW_ENCODE_NOKEY: u16 = 0x0800;
pub(crate) const IW_ENCODE_OPEN: u16 = 0x2000;
pub(crate) const IW_ENCODE_RESTRICTED: u16 = 0x4000;
pub(crate) const IW_ENCODE_DISABLED: u16 = 0x8000;

pub(crate) const IW_FREQ_FIXED: u8 = 0x01;

pub(crate) const IW_MAX_BITRATES: usize = 32;
pub(crate) const IW_MAX_ENCODING_SIZES: usize = 8;
pub(crate) const IW_MAX_TXPOWER: usize = 8;
pub(crate) const IW_MAX_FREQUENCIES: usize = 32;

// MII probing. The modern opcodes are tried first, with the legacy
// SIOCDEVPRIVATE block as fallback for drivers predating them.
const SIOCDEVPRIVATE: c_ulong = 0x89F0;
const SIOCGMIIPHY: c_ulong = 0x8947;
const SIOCGMIIREG: c_ulong = 0x8948;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct IwParam {
    pub value: i32,
    pub fixed: u8,
    pub disabled: u8,
    pub flags: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct IwFreq {
    pub m: i32,
    pub e: i16,
    pub i: u8,
    pub flags: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct IwQuality {
    pub qual: u8,
    pub level: u8,
    pub noise: u8,
    pub updated: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct IwPoint {
    pub pointer: *mut libc::c_void,
    pub length: u16,
    pub flags: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct IwDiscarded {
    pub nwid: u32,
    pub code: u32,
    pub fragment: u32,
    pub retries: u32,
    pub misc: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct IwMissed {
    pub beacon: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct IwStatistics {
    pub status: u16,
    pub qual: IwQuality,
    pub discard: IwDiscarded,
    pub miss: IwMissed,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) union IwReqData {
    pub name: [c_char; IFNAMSIZ],
    pub essid: IwPoint,
    pub data: IwPoint,
    pub mode: u32,
    pub freq: IwFreq,
    pub bitrate: IwParam,
    pub ap_addr: libc::sockaddr,
    pub qual: IwQuality,
}

#[repr(C)]
pub(crate) struct IwReq {
    pub ifr_name: [c_char; IFNAMSIZ],
    pub u: IwReqData,
}

impl IwReq {
    pub fn for_iface(iface: &str) -> IwReq {
        let mut req: IwReq = unsafe { std::mem::zeroed() };
        copy_iface_name(&mut req.ifr_name, iface);
        req
    }
}

/// Capability range reported by a driver through `SIOCGIWRANGE`.
/// Layout follows wireless extensions v19+.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct IwRange {
    pub throughput: u32,
    pub min_nwid: u32,
    pub max_nwid: u32,
    pub old_num_channels: u16,
    pub old_num_frequency: u8,
    pub scan_capa: u8,
    pub event_capa: [u32; 6],
    pub sensitivity: i32,
    pub max_qual: IwQuality,
    pub avg_qual: IwQuality,
    pub num_bitrates: u8,
    pub bitrate: [i32; IW_MAX_BITRATES],
    pub min_rts: i32,
    pub max_rts: i32,
    pub min_frag: i32,
    pub max_frag: i32,
    pub min_pmp: i32,
    pub max_pmp: i32,
    pub min_pmt: i32,
    pub max_pmt: i32,
    pub pmp_flags: u16,
    pub pmt_flags: u16,
    pub pm_capa: u16,
    pub encoding_size: [u16; IW_MAX_ENCODING_SIZES],
    pub num_encoding_sizes: u8,
    pub max_encoding_tokens: u8,
    pub encoding_login_index: u8,
    pub txpower_capa: u16,
    pub num_txpower: u8,
    pub txpower: [i32; IW_MAX_TXPOWER],
    pub we_version_compiled: u8,
    pub we_version_source: u8,
    pub retry_capa: u16,
    pub retry_flags: u16,
    pub r_time_flags: u16,
    pub min_retry: i32,
    pub max_retry: i32,
    pub min_r_time: i32,
    pub max_r_time: i32,
    pub num_channels: u16,
    pub num_frequency: u8,
    pub freq: [IwFreq; IW_MAX_FREQUENCIES],
    pub enc_capa: u32,
}

impl Default for IwRange {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

/// One access point cell as decoded from a driver scan stream.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScanRecord {
    pub essid: Option<String>,
    pub bssid: Option<[u8; 6]>,
    pub mode: Option<u32>,
    pub freq: Option<f64>,
    pub quality: Option<IwQuality>,
    pub key_flags: Option<u16>,
}

/// Datagram control socket for network ioctls.
///
/// Tries PF_INET first and falls back to PF_PACKET and PF_INET6, since
/// an IPv4-less host can still configure interfaces through the others.
pub(crate) struct ControlSocket(OwnedFd);

impl ControlSocket {
    pub fn open() -> io::Result<ControlSocket> {
        for family in [libc::PF_INET, libc::PF_PACKET, libc::PF_INET6] {
            let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, 0) };
            if fd >= 0 {
                return Ok(ControlSocket(unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
        Err(io::Error::last_os_error())
    }

    pub fn fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

fn copy_iface_name(dst: &mut [c_char; IFNAMSIZ], iface: &str) {
    let bytes = iface.as_bytes();
    let n = bytes.len().min(IFNAMSIZ - 1);
    for (i, b) in bytes[..n].iter().enumerate() {
        dst[i] = *b as c_char;
    }
    dst[n] = 0;
}

/// Issue a wireless-extension ioctl for `iface`.
pub(crate) fn iw_request(
    sock: &ControlSocket,
    iface: &str,
    cmd: c_ulong,
    req: &mut IwReq,
) -> io::Result<()> {
    copy_iface_name(&mut req.ifr_name, iface);
    let rc = unsafe { libc::ioctl(sock.fd(), cmd as _, req as *mut IwReq) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Issue a plain interface ioctl (`SIOCGIF*` family) for `iface`.
pub(crate) fn if_request(
    sock: &ControlSocket,
    iface: &str,
    cmd: c_ulong,
    req: &mut libc::ifreq,
) -> io::Result<()> {
    let bytes = iface.as_bytes();
    let n = bytes.len().min(IFNAMSIZ - 1);
    for (i, b) in bytes[..n].iter().enumerate() {
        req.ifr_name[i] = *b as c_char;
    }
    req.ifr_name[n] = 0;
    let rc = unsafe { libc::ioctl(sock.fd(), cmd as _, req as *mut libc::ifreq) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Convert a driver `iw_freq` to Hz.
pub(crate) fn freq_to_float(f: &IwFreq) -> f64 {
    (f.m as f64) * 10f64.powi(f.e as i32)
}

/// Convert Hz into the mantissa/exponent form drivers expect.
pub(crate) fn float_to_freq(hz: f64) -> IwFreq {
    let mut m = hz;
    let mut e: i16 = 0;
    // Keep the mantissa inside i32 range.
    while m > i32::MAX as f64 {
        m /= 10.0;
        e += 1;
    }
    IwFreq {
        m: m as i32,
        e,
        i: 0,
        flags: 0,
    }
}

/// Map a frequency to its channel number through a driver's range table.
pub(crate) fn freq_to_channel(hz: f64, range: &IwRange) -> Option<i32> {
    let n = (range.num_frequency as usize).min(IW_MAX_FREQUENCIES);
    for entry in &range.freq[..n] {
        let table_hz = freq_to_float(entry);
        if (table_hz - hz).abs() < 1.0 {
            return Some(entry.i as i32);
        }
    }
    None
}

/// Map a channel number to its frequency through a driver's range table.
pub(crate) fn channel_to_freq(channel: i32, range: &IwRange) -> Option<f64> {
    let n = (range.num_frequency as usize).min(IW_MAX_FREQUENCIES);
    for entry in &range.freq[..n] {
        if entry.i as i32 == channel {
            return Some(freq_to_float(entry));
        }
    }
    None
}

/// Parse the event stream returned by `SIOCGIWSCAN` into per-cell records.
///
/// Uses the WE-19+ stream layout: every event is `{len: u16, cmd: u16}`
/// followed by its payload, and "point" payloads carry `{length: u16,
/// flags: u16}` inline with the data behind them (the user-space pointer
/// is stripped). A `SIOCGIWAP` event opens a new cell.
pub(crate) fn parse_scan_stream(buf: &[u8]) -> Vec<ScanRecord> {
    let mut records: Vec<ScanRecord> = Vec::new();
    let mut current: Option<ScanRecord> = None;
    let mut off = 0usize;

    while off + 4 <= buf.len() {
        let len = u16::from_ne_bytes([buf[off], buf[off + 1]]) as usize;
        let cmd = u16::from_ne_bytes([buf[off + 2], buf[off + 3]]);
        if len < 4 || off + len > buf.len() {
            break;
        }
        let payload = &buf[off + 4..off + len];

        match cmd as c_ulong {
            SIOCGIWAP => {
                if let Some(done) = current.take() {
                    records.push(done);
                }
                let mut rec = ScanRecord::default();
                // Payload is a sockaddr: 2 bytes family, then sa_data.
                if payload.len() >= 8 {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(&payload[2..8]);
                    rec.bssid = Some(mac);
                }
                current = Some(rec);
            }
            SIOCGIWESSID => {
                if let (Some(rec), true) = (current.as_mut(), payload.len() >= 4) {
                    let dlen = u16::from_ne_bytes([payload[0], payload[1]]) as usize;
                    let data = &payload[4..];
                    let dlen = dlen.min(data.len());
                    if dlen > 0 {
                        rec.essid = Some(String::from_utf8_lossy(&data[..dlen]).into_owned());
                    }
                }
            }
            SIOCGIWMODE => {
                if let (Some(rec), true) = (current.as_mut(), payload.len() >= 4) {
                    rec.mode = Some(u32::from_ne_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ]));
                }
            }
            SIOCGIWFREQ => {
                if let (Some(rec), true) = (current.as_mut(), payload.len() >= 8) {
                    let f = IwFreq {
                        m: i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]),
                        e: i16::from_ne_bytes([payload[4], payload[5]]),
                        i: payload[6],
                        flags: payload[7],
                    };
                    rec.freq = Some(freq_to_float(&f));
                }
            }
            SIOCGIWENCODE => {
                if let (Some(rec), true) = (current.as_mut(), payload.len() >= 4) {
                    rec.key_flags = Some(u16::from_ne_bytes([payload[2], payload[3]]));
                }
            }
            _ if cmd == IWEVQUAL => {
                if let (Some(rec), true) = (current.as_mut(), payload.len() >= 4) {
                    rec.quality = Some(IwQuality {
                        qual: payload[0],
                        level: payload[1],
                        noise: payload[2],
                        updated: payload[3],
                    });
                }
            }
            _ => {}
        }
        off += len;
    }

    if let Some(done) = current.take() {
        records.push(done);
    }
    records
}

// MII transceiver access for wired link probing.

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct MiiIoctlData {
    phy_id: u16,
    reg_num: u16,
    val_in: u16,
    val_out: u16,
}

fn mdio_read(
    sock: &ControlSocket,
    ifr: &mut libc::ifreq,
    location: u16,
    new_ioctl_nums: bool,
) -> io::Result<u16> {
    let cmd = if new_ioctl_nums {
        SIOCGMIIREG
    } else {
        SIOCDEVPRIVATE + 1
    };
    unsafe {
        let data = &mut ifr.ifr_ifru as *mut _ as *mut MiiIoctlData;
        (*data).reg_num = location;
        let rc = libc::ioctl(sock.fd(), cmd as _, ifr as *mut libc::ifreq);
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((*data).val_out)
    }
}

/// Decide link state from MII basic status register 1.
///
/// Bit 0x0004 is "link established" and 0x0010/0x0002 are fault bits, so
/// a usable link shows exactly 0x0004 within the 0x0016 mask.
pub(crate) fn mii_link_up(status_word: u16) -> bool {
    (status_word & 0x0016) == 0x0004
}

/// Probe a wired interface's link through its MII registers.
pub(crate) fn mii_get_link(iface: &str) -> io::Result<bool> {
    let sock = ControlSocket::open()?;
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let bytes = iface.as_bytes();
    let n = bytes.len().min(IFNAMSIZ - 1);
    for (i, b) in bytes[..n].iter().enumerate() {
        ifr.ifr_name[i] = *b as c_char;
    }

    let new_ioctl_nums = {
        let rc = unsafe { libc::ioctl(sock.fd(), SIOCGMIIPHY as _, &mut ifr as *mut libc::ifreq) };
        if rc >= 0 {
            true
        } else {
            let rc =
                unsafe { libc::ioctl(sock.fd(), SIOCDEVPRIVATE as _, &mut ifr as *mut libc::ifreq) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            false
        }
    };

    // Register 1 latches failures; read twice so sticky bits clear.
    let _ = mdio_read(&sock, &mut ifr, 1, new_ioctl_nums)?;
    let status_word = mdio_read(&sock, &mut ifr, 1, new_ioctl_nums)?;

    Ok(mii_link_up(status_word))
}
