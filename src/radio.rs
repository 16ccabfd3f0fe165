//! Radio control: typed primitives over the wireless-extension and
//! socket ioctl surface, per device.
//!
//! Each primitive either succeeds or fails with an I/O error; drivers
//! that silently swallow a command count as success. Synthetic devices
//! short-circuit every primitive to deterministic fixtures so the rest
//! of the engine can run without hardware.

use log::{debug, error, warn};
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crate::constants::{test_device, wireless};
use crate::device::{Device, RadioRange, SignalState};
use crate::models::{AuthMethod, DeviceKind, WirelessMode};
use crate::wext::{
    self, ControlSocket, IwParam, IwPoint, IwQuality, IwRange, IwReq, IwStatistics, ScanRecord,
    IW_ENCODE_DISABLED, IW_ENCODE_ENABLED, IW_ENCODE_NOKEY, IW_ENCODE_OPEN, IW_ENCODE_RESTRICTED,
    IW_FREQ_FIXED, IW_MODE_ADHOC, IW_MODE_INFRA, SIOCGIWAP, SIOCGIWESSID, SIOCGIWFREQ,
    SIOCGIWMODE, SIOCGIWNAME, SIOCGIWRANGE, SIOCGIWRATE, SIOCGIWSCAN, SIOCGIWSTATS, SIOCSIWENCODE,
    SIOCSIWESSID, SIOCSIWFREQ, SIOCSIWMODE, SIOCSIWRATE, SIOCSIWSCAN,
};

/// Whether the kernel speaks wireless extensions for this interface.
pub(crate) fn probe_wireless_extensions(iface: &str) -> bool {
    let Ok(sock) = ControlSocket::open() else {
        return false;
    };
    let mut req = IwReq::for_iface(iface);
    wext::iw_request(&sock, iface, SIOCGIWNAME, &mut req).is_ok()
}

/// Whether the driver supports real scanning; cards that reject the
/// scan command outright get the pseudo-scan instead.
pub(crate) fn probe_scan_capability(iface: &str) -> bool {
    let Ok(sock) = ControlSocket::open() else {
        return false;
    };
    let mut req = IwReq::for_iface(iface);
    match wext::iw_request(&sock, iface, SIOCSIWSCAN, &mut req) {
        Err(e) if e.raw_os_error() == Some(libc::EOPNOTSUPP) => false,
        _ => true,
    }
}

/// Strength percentage from a driver quality reading.
///
/// The quality/ceiling ratio is used when the driver reports a ceiling;
/// otherwise the reading is scored as signal over noise. `None` means
/// the reading is unusable and feeds the smoothing counter.
pub(crate) fn qual_to_percent(qual: &IwQuality, max_quality: u8) -> Option<u8> {
    if max_quality > 0 {
        return Some(((qual.qual as u32 * 100) / max_quality as u32).min(100) as u8);
    }
    if qual.level > qual.noise && qual.level > 0 {
        let snr = (qual.level - qual.noise) as u32;
        let headroom = (256 - qual.noise as u32).max(1);
        return Some(((snr * 100) / headroom).min(100) as u8);
    }
    None
}

/// Fold one reading into the smoothed signal state.
///
/// Up to three consecutive invalid readings repeat the last valid
/// percentage (Atmel cards blank out for a beat); the fourth forces the
/// smoothed value to unknown.
pub(crate) fn smooth_signal(sig: &mut SignalState, reading: Option<(u8, u8, u8)>) {
    match reading {
        Some((percent, noise, max_quality)) => {
            sig.strength = Some(percent);
            sig.noise = noise;
            sig.max_quality = max_quality;
            sig.invalid_reads = 0;
        }
        None => {
            sig.invalid_reads += 1;
            if sig.invalid_reads > 3 {
                sig.strength = None;
                sig.noise = 0;
                sig.max_quality = 0;
                sig.invalid_reads = 0;
            }
        }
    }
}

fn parse_wep_key(key: &str) -> Option<Vec<u8>> {
    if let Some(ascii) = key.strip_prefix("s:") {
        return Some(ascii.as_bytes().to_vec());
    }
    let cleaned: Vec<u8> = key.bytes().filter(|b| *b != b':' && *b != b'-').collect();
    if cleaned.is_empty() || cleaned.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(cleaned.len() / 2);
    for pair in cleaned.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

fn mode_from_raw(raw: u32) -> WirelessMode {
    match raw {
        IW_MODE_ADHOC => WirelessMode::AdHoc,
        IW_MODE_INFRA => WirelessMode::Infrastructure,
        _ => WirelessMode::Unknown,
    }
}

pub(crate) fn mode_to_raw(mode: WirelessMode) -> u32 {
    match mode {
        WirelessMode::AdHoc => IW_MODE_ADHOC,
        _ => IW_MODE_INFRA,
    }
}

fn iw_point(buf: *mut libc::c_void, length: u16, flags: u16) -> IwPoint {
    IwPoint {
        pointer: buf,
        length,
        flags,
    }
}

impl Device {
    fn set_up_down(&self, up: bool) -> crate::Result<()> {
        if self.is_synthetic() {
            self.test_up.store(up, Ordering::SeqCst);
            return Ok(());
        }
        if self.driver_support() == crate::models::DriverSupport::Unsupported {
            return Ok(());
        }

        let sock = ControlSocket::open()?;
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        wext::if_request(&sock, self.iface(), libc::SIOCGIFFLAGS as _, &mut ifr)?;

        let up_bit = libc::IFF_UP as libc::c_short;
        let flags = unsafe { ifr.ifr_ifru.ifru_flags };
        let already_up = (flags & up_bit) != 0;
        if already_up == up {
            return Ok(());
        }

        let new_flags = if up { flags | up_bit } else { flags & !up_bit };
        ifr.ifr_ifru.ifru_flags = new_flags;
        if let Err(e) = wext::if_request(&sock, self.iface(), libc::SIOCSIFFLAGS as _, &mut ifr) {
            error!(
                "could not bring device {} {}: {e}",
                self.iface(),
                if up { "up" } else { "down" }
            );
            return Err(e.into());
        }
        Ok(())
    }

    pub fn bring_up(&self) -> crate::Result<()> {
        self.set_up_down(true)
    }

    pub fn bring_down(&self) -> crate::Result<()> {
        self.set_up_down(false)
    }

    pub fn is_up(&self) -> bool {
        if self.is_synthetic() {
            return self.test_up.load(Ordering::SeqCst);
        }
        let Ok(sock) = ControlSocket::open() else {
            return false;
        };
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        match wext::if_request(&sock, self.iface(), libc::SIOCGIFFLAGS as _, &mut ifr) {
            Ok(()) => {
                let flags = unsafe { ifr.ifr_ifru.ifru_flags };
                (flags & libc::IFF_UP as libc::c_short) != 0
            }
            Err(e) => {
                error!("could not get flags for device {}: {e}", self.iface());
                false
            }
        }
    }

    /// The ESSID the card is currently chasing, if any.
    pub fn essid(&self) -> Option<String> {
        let wi = self.wireless.as_ref()?;

        // Synthetic devices answer with their best AP's ESSID, falling
        // back to whatever was last set on the card.
        if self.is_synthetic() {
            if let Some(best) = self.best_ap() {
                if let Some(essid) = best.essid() {
                    return Some(essid.to_string());
                }
            }
            let cur = wi.cur_essid.lock().unwrap();
            return (!cur.is_empty()).then(|| cur.clone());
        }

        let Ok(sock) = ControlSocket::open() else {
            return None;
        };
        let mut buf = [0u8; wireless::ESSID_MAX_SIZE + 1];
        let mut req = IwReq::for_iface(self.iface());
        req.u.essid = iw_point(buf.as_mut_ptr() as *mut libc::c_void, buf.len() as u16, 0);
        match wext::iw_request(&sock, self.iface(), SIOCGIWESSID, &mut req) {
            Ok(()) => {
                let n = (unsafe { req.u.essid.length } as usize).min(buf.len());
                let end = buf[..n].iter().position(|b| *b == 0).unwrap_or(n);
                let essid = String::from_utf8_lossy(&buf[..end]).trim().to_string();
                *wi.cur_essid.lock().unwrap() = essid.clone();
                (!essid.is_empty()).then_some(essid)
            }
            Err(e) => {
                error!("error getting ESSID for device {}: {e}", self.iface());
                None
            }
        }
    }

    /// Points the card at an ESSID. Input past the 32-byte cap is
    /// truncated.
    pub fn set_essid(&self, essid: &str) {
        let Some(wi) = self.wireless.as_ref() else {
            return;
        };
        let bytes = essid.as_bytes();
        let n = bytes.len().min(wireless::ESSID_MAX_SIZE);
        let safe = &bytes[..n];

        if self.is_synthetic() {
            *wi.cur_essid.lock().unwrap() = String::from_utf8_lossy(safe).into_owned();
            return;
        }

        let Ok(sock) = ControlSocket::open() else {
            return;
        };
        let mut buf = [0u8; wireless::ESSID_MAX_SIZE + 1];
        buf[..n].copy_from_slice(safe);
        let mut req = IwReq::for_iface(self.iface());
        req.u.essid = iw_point(buf.as_mut_ptr() as *mut libc::c_void, (n + 1) as u16, 1);
        if let Err(e) = wext::iw_request(&sock, self.iface(), SIOCSIWESSID, &mut req) {
            error!(
                "error setting ESSID '{}' for device {}: {e}",
                String::from_utf8_lossy(safe),
                self.iface()
            );
        }
    }

    /// Frequency the radio is tuned to, in Hz; 0.0 when unknown.
    pub fn frequency(&self) -> f64 {
        if self.wireless.is_none() {
            return 0.0;
        }
        if self.is_synthetic() {
            return test_device::FREQUENCY;
        }
        let Ok(sock) = ControlSocket::open() else {
            return 0.0;
        };
        let mut req = IwReq::for_iface(self.iface());
        match wext::iw_request(&sock, self.iface(), SIOCGIWFREQ, &mut req) {
            Ok(()) => wext::freq_to_float(unsafe { &req.u.freq }),
            Err(e) => {
                error!("error getting frequency for device {}: {e}", self.iface());
                0.0
            }
        }
    }

    pub fn set_frequency(&self, freq: f64) {
        if self.wireless.is_none() || self.is_synthetic() {
            return;
        }
        let Ok(sock) = ControlSocket::open() else {
            return;
        };
        let mut req = IwReq::for_iface(self.iface());
        let mut f = wext::float_to_freq(freq);
        f.flags = IW_FREQ_FIXED;
        req.u.freq = f;
        if let Err(e) = wext::iw_request(&sock, self.iface(), SIOCSIWFREQ, &mut req) {
            error!(
                "error setting frequency {freq} for device {}: {e}",
                self.iface()
            );
        }
    }

    /// Bitrate in kb/s; 0 when unknown.
    pub fn bitrate(&self) -> i32 {
        if self.wireless.is_none() {
            return 0;
        }
        if self.is_synthetic() {
            return test_device::BITRATE;
        }
        let Ok(sock) = ControlSocket::open() else {
            return 0;
        };
        let mut req = IwReq::for_iface(self.iface());
        match wext::iw_request(&sock, self.iface(), SIOCGIWRATE, &mut req) {
            Ok(()) => (unsafe { req.u.bitrate.value }) / 1000,
            Err(_) => 0,
        }
    }

    /// Sets the bitrate in kb/s; 0 selects automatic rate.
    pub fn set_bitrate(&self, kbps: i32) {
        if self.wireless.is_none() || self.is_synthetic() {
            return;
        }
        let Ok(sock) = ControlSocket::open() else {
            return;
        };
        let mut req = IwReq::for_iface(self.iface());
        req.u.bitrate = if kbps != 0 {
            IwParam {
                value: kbps * 1000,
                fixed: 1,
                disabled: 0,
                flags: 0,
            }
        } else {
            IwParam {
                value: -1,
                fixed: 0,
                disabled: 0,
                flags: 0,
            }
        };
        // Not all drivers support rate setting (ipw2x00); fail silently.
        let _ = wext::iw_request(&sock, self.iface(), SIOCSIWRATE, &mut req);
    }

    /// Programs the WEP key and authentication mode.
    ///
    /// An empty or absent key disables encryption. Some drivers (Cisco)
    /// conflate Open System with "no WEP", so the auth mode bit is
    /// always set explicitly alongside the key.
    pub fn set_enc_key(&self, key: Option<&str>, auth: AuthMethod) {
        if self.wireless.is_none() || self.is_synthetic() {
            return;
        }
        let Ok(sock) = ControlSocket::open() else {
            error!(
                "could not get control socket to set key on {}",
                self.iface()
            );
            return;
        };

        let mut req = IwReq::for_iface(self.iface());
        let mut material: Vec<u8> = Vec::new();
        let mut flags = IW_ENCODE_ENABLED;

        let is_blank = key.map_or(true, str::is_empty);
        if is_blank {
            flags |= IW_ENCODE_DISABLED | IW_ENCODE_NOKEY;
            req.u.data = iw_point(std::ptr::null_mut(), 0, flags);
        } else {
            let raw = key.unwrap_or_default();
            let mut n = raw.len().min(wireless::ENCODING_TOKEN_MAX);
            while !raw.is_char_boundary(n) {
                n -= 1;
            }
            let Some(parsed) = parse_wep_key(&raw[..n]) else {
                error!("unparseable WEP key for device {}", self.iface());
                return;
            };
            material = parsed;
            match auth {
                AuthMethod::OpenSystem => flags |= IW_ENCODE_OPEN,
                _ => flags |= IW_ENCODE_RESTRICTED,
            }
            req.u.data = iw_point(
                material.as_mut_ptr() as *mut libc::c_void,
                material.len() as u16,
                flags,
            );
        }

        if let Err(e) = wext::iw_request(&sock, self.iface(), SIOCSIWENCODE, &mut req) {
            error!("error setting key for device {}: {e}", self.iface());
        }
        drop(material);
    }

    /// BSSID of the base station the card is associated with, if the
    /// address is usable.
    pub fn associated_bssid(&self) -> Option<[u8; 6]> {
        self.wireless.as_ref()?;

        if self.is_synthetic() {
            return self.link_active().then_some(test_device::HW_ADDR);
        }

        let sock = ControlSocket::open().ok()?;
        let mut req = IwReq::for_iface(self.iface());
        wext::iw_request(&sock, self.iface(), SIOCGIWAP, &mut req).ok()?;
        let mut addr = [0u8; 6];
        unsafe {
            for (i, b) in req.u.ap_addr.sa_data[..6].iter().enumerate() {
                addr[i] = *b as u8;
            }
        }
        crate::access_point::ethernet_address_is_valid(&addr).then_some(addr)
    }

    pub fn mode(&self) -> WirelessMode {
        if self.wireless.is_none() {
            return WirelessMode::Unknown;
        }
        if self.is_synthetic() {
            return WirelessMode::Infrastructure;
        }
        let Ok(sock) = ControlSocket::open() else {
            return WirelessMode::Unknown;
        };
        let mut req = IwReq::for_iface(self.iface());
        match wext::iw_request(&sock, self.iface(), SIOCGIWMODE, &mut req) {
            Ok(()) => mode_from_raw(unsafe { req.u.mode }),
            Err(e) => {
                error!("error getting mode for device {}: {e}", self.iface());
                WirelessMode::Unknown
            }
        }
    }

    pub fn set_mode(&self, mode: WirelessMode) -> crate::Result<()> {
        if self.wireless.is_none() {
            return Ok(());
        }
        if mode == WirelessMode::Unknown {
            return Err(crate::models::DeviceError::InvalidArgument(
                "cannot set unknown wireless mode".into(),
            ));
        }
        if self.is_synthetic() {
            return Ok(());
        }
        let sock = ControlSocket::open()?;
        let mut req = IwReq::for_iface(self.iface());
        req.u.mode = mode_to_raw(mode);
        if let Err(e) = wext::iw_request(&sock, self.iface(), SIOCSIWMODE, &mut req) {
            error!("error setting device {} to {mode} mode: {e}", self.iface());
            return Err(e.into());
        }
        Ok(())
    }

    /// Whether the card reports an association.
    ///
    /// ipw2x00 cards short-circuit through the driver name, which reads
    /// `unassociated` when there is no link; everyone else is judged by
    /// whether the associated BSSID is a usable address.
    pub fn wireless_is_associated(&self) -> bool {
        if self.wireless.is_none() {
            return false;
        }
        if self.is_synthetic() {
            return self.link_active();
        }

        if let Ok(sock) = ControlSocket::open() {
            let mut req = IwReq::for_iface(self.iface());
            if wext::iw_request(&sock, self.iface(), SIOCGIWNAME, &mut req).is_ok() {
                let name: Vec<u8> = unsafe { req.u.name.iter().map(|c| *c as u8).collect() };
                let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
                if &name[..end] == b"unassociated" {
                    return false;
                }
            }
        }

        self.associated_bssid().is_some()
    }

    fn wireless_link_active(&self) -> bool {
        if self.is_synthetic() {
            return self.link_active();
        }
        if !self.wireless_is_associated() {
            return false;
        }
        // Without a best AP there is no link we actually want to use,
        // and a card chasing the wrong ESSID does not count either.
        match self.best_ap() {
            Some(_) => !self.need_ap_switch(),
            None => false,
        }
    }

    fn wired_link_active(&self, check_mii: bool) -> bool {
        if self.is_synthetic() {
            return self.link_active();
        }
        if check_mii {
            // HAL may not have seen the link event yet on card
            // insertion; the MII registers know first.
            return match wext::mii_get_link(self.iface()) {
                Ok(link) => link,
                Err(e) => {
                    warn!("MII probe failed on {}: {e}", self.iface());
                    false
                }
            };
        }
        let props = &self.platform.props;
        if props.exists(self.udi(), "net.80203.link") {
            return props.get_bool(self.udi(), "net.80203.link");
        }
        false
    }

    /// Refreshes the link flag from whatever source fits the device
    /// kind, updating the smoothed signal strength along the way.
    pub fn update_link_active(&self, check_mii: bool) {
        let link = match self.kind() {
            DeviceKind::Wireless => {
                let link = self.wireless_link_active();
                self.update_signal_strength();
                link
            }
            DeviceKind::Wired => self.wired_link_active(check_mii),
            DeviceKind::Unknown => self.link_active(),
        };

        if link != self.link_active() {
            debug!(
                "device {} link is now {}",
                self.iface(),
                if link { "up" } else { "down" }
            );
            self.set_link_active(link);
        }
    }

    /// Refreshes the smoothed signal strength from the driver stats.
    pub fn update_signal_strength(&self) {
        let Some(wi) = self.wireless.as_ref() else {
            return;
        };

        if self.is_synthetic() {
            let mut sig = wi.signal.lock().unwrap();
            sig.strength = Some(test_device::STRENGTH);
            sig.invalid_reads = 0;
            return;
        }

        let reading = self.read_signal_stats();
        smooth_signal(&mut wi.signal.lock().unwrap(), reading);
    }

    /// One raw stats reading: `(percent, noise, max_quality)`.
    fn read_signal_stats(&self) -> Option<(u8, u8, u8)> {
        let sock = ControlSocket::open().ok()?;

        let mut range = IwRange::default();
        let mut req = IwReq::for_iface(self.iface());
        req.u.data = iw_point(
            &mut range as *mut IwRange as *mut libc::c_void,
            std::mem::size_of::<IwRange>() as u16,
            0,
        );
        let has_range = wext::iw_request(&sock, self.iface(), SIOCGIWRANGE, &mut req).is_ok();

        let mut stats = IwStatistics::default();
        let mut req = IwReq::for_iface(self.iface());
        req.u.data = iw_point(
            &mut stats as *mut IwStatistics as *mut libc::c_void,
            std::mem::size_of::<IwStatistics>() as u16,
            1,
        );
        wext::iw_request(&sock, self.iface(), SIOCGIWSTATS, &mut req).ok()?;

        let max_quality = if has_range { range.max_qual.qual } else { 0 };
        let percent = qual_to_percent(&stats.qual, max_quality)?;
        Some((percent, stats.qual.noise, max_quality))
    }

    /// Frames the card dropped because it could not decrypt them.
    pub fn bad_crypt_packets(&self) -> u32 {
        if self.wireless.is_none() || self.is_synthetic() {
            return 0;
        }
        let Ok(sock) = ControlSocket::open() else {
            return 0;
        };
        let mut stats = IwStatistics::default();
        let mut req = IwReq::for_iface(self.iface());
        req.u.data = iw_point(
            &mut stats as *mut IwStatistics as *mut libc::c_void,
            std::mem::size_of::<IwStatistics>() as u16,
            0,
        );
        match wext::iw_request(&sock, self.iface(), SIOCGIWSTATS, &mut req) {
            Ok(()) => stats.discard.code,
            Err(_) => 0,
        }
    }

    /// Reads the card's tunable channel table and quality ceiling.
    pub fn update_range_info(&self) {
        let Some(wi) = self.wireless.as_ref() else {
            return;
        };
        if self.is_synthetic() {
            // Synthetic ranges come in through set_test_range.
            return;
        }

        let Ok(sock) = ControlSocket::open() else {
            return;
        };
        let mut raw = IwRange::default();
        let mut req = IwReq::for_iface(self.iface());
        req.u.data = iw_point(
            &mut raw as *mut IwRange as *mut libc::c_void,
            std::mem::size_of::<IwRange>() as u16,
            0,
        );
        let range = match wext::iw_request(&sock, self.iface(), SIOCGIWRANGE, &mut req) {
            Ok(()) => {
                let n = (raw.num_frequency as usize).min(wireless::MAX_FREQUENCIES);
                let channels = raw.freq[..n]
                    .iter()
                    .map(|f| (f.i as i32, wext::freq_to_float(f)))
                    .collect();
                RadioRange {
                    max_quality: raw.max_qual.qual,
                    channels,
                }
            }
            Err(_) => RadioRange::default(),
        };
        *wi.range.lock().unwrap() = range;
    }

    /// How long to let the card associate before checking for a link.
    pub fn association_pause(&self) -> Duration {
        let num = self.radio_range().num_frequency();
        self.platform.timings.association_pause(num)
    }

    /// Runs one driver scan, preserving the card's mode, frequency and
    /// bitrate around it. Scanning only returns a full set of results
    /// in Infrastructure mode.
    pub(crate) fn run_driver_scan(&self) -> std::io::Result<Vec<ScanRecord>> {
        let sock = ControlSocket::open()?;

        let orig_mode = self.mode();
        let orig_freq = self.frequency();
        let orig_rate = self.bitrate();

        let _ = self.set_mode(WirelessMode::Infrastructure);

        let mut result = self.scan_once(&sock);
        if let Err(e) = &result {
            let no_data = matches!(e.raw_os_error(), Some(libc::ENODATA) | Some(libc::EAGAIN));
            if no_data {
                // The card has not compiled its list yet; A/B/G chips
                // sweeping many channels need the extra time.
                thread::sleep(self.association_pause() / 2);
                result = self.scan_once(&sock);
            }
        }

        if orig_mode != WirelessMode::Unknown && orig_mode != WirelessMode::Infrastructure {
            let _ = self.set_mode(orig_mode);
        }
        if orig_freq > 0.0 {
            self.set_frequency(orig_freq);
        }
        self.set_bitrate(orig_rate);

        result
    }

    fn scan_once(&self, sock: &ControlSocket) -> std::io::Result<Vec<ScanRecord>> {
        let mut req = IwReq::for_iface(self.iface());
        // Trigger; EBUSY means a scan is already in flight, which suits
        // us just as well.
        if let Err(e) = wext::iw_request(sock, self.iface(), SIOCSIWSCAN, &mut req) {
            if e.raw_os_error() != Some(libc::EBUSY) {
                return Err(e);
            }
        }

        let mut buf = vec![0u8; 4096];
        loop {
            let mut req = IwReq::for_iface(self.iface());
            req.u.data = iw_point(buf.as_mut_ptr() as *mut libc::c_void, buf.len() as u16, 0);
            match wext::iw_request(sock, self.iface(), SIOCGIWSCAN, &mut req) {
                Ok(()) => {
                    let n = (unsafe { req.u.data.length } as usize).min(buf.len());
                    return Ok(wext::parse_scan_stream(&buf[..n]));
                }
                Err(e) if e.raw_os_error() == Some(libc::E2BIG) && buf.len() < 0xFFFF => {
                    let grown = (buf.len() * 2).min(0xFFFF);
                    buf.resize(grown, 0);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refreshes the device's notion of its IPv4 address, publishing a
    /// change event when it moved.
    pub fn update_ip4_address(&self) {
        let new_address = if self.is_synthetic() {
            test_device::IP4_ADDRESS
        } else {
            let Ok(sock) = ControlSocket::open() else {
                return;
            };
            let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
            if wext::if_request(&sock, self.iface(), libc::SIOCGIFADDR as _, &mut ifr).is_err() {
                return;
            }
            let raw = unsafe {
                let sin =
                    &ifr.ifr_ifru.ifru_addr as *const libc::sockaddr as *const libc::sockaddr_in;
                (*sin).sin_addr.s_addr
            };
            u32::from_be(raw)
        };

        let old = self.ip4_address.swap(new_address, Ordering::SeqCst);
        if old != new_address {
            self.platform
                .bus
                .device_ip4_changed(self, Ipv4Addr::from(new_address));
        }
    }

    /// Refreshes the cached hardware address.
    pub fn update_hw_address(&self) {
        if self.is_synthetic() {
            *self.hw_addr.lock().unwrap() = test_device::HW_ADDR;
            return;
        }
        let Ok(sock) = ControlSocket::open() else {
            return;
        };
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        if wext::if_request(&sock, self.iface(), libc::SIOCGIFHWADDR as _, &mut ifr).is_err() {
            return;
        }
        let mut addr = [0u8; 6];
        unsafe {
            for (i, b) in ifr.ifr_ifru.ifru_hwaddr.sa_data[..6].iter().enumerate() {
                addr[i] = *b as u8;
            }
        }
        *self.hw_addr.lock().unwrap() = addr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qual_percent_uses_driver_ceiling() {
        let q = IwQuality {
            qual: 47,
            level: 0,
            noise: 0,
            updated: 0,
        };
        assert_eq!(qual_to_percent(&q, 94), Some(50));
        assert_eq!(qual_to_percent(&q, 47), Some(100));
        // Readings above the ceiling clamp rather than overflow.
        assert_eq!(qual_to_percent(&q, 20), Some(100));
    }

    #[test]
    fn qual_percent_falls_back_to_snr() {
        let q = IwQuality {
            qual: 0,
            level: 190,
            noise: 160,
            updated: 0,
        };
        let pct = qual_to_percent(&q, 0);
        assert!(pct.is_some());
        assert!(pct.unwrap() <= 100);

        let dead = IwQuality {
            qual: 0,
            level: 0,
            noise: 0,
            updated: 0,
        };
        assert_eq!(qual_to_percent(&dead, 0), None);
    }

    #[test]
    fn smoothing_tolerates_three_invalid_reads() {
        let mut sig = SignalState::default();
        smooth_signal(&mut sig, Some((60, 10, 94)));
        assert_eq!(sig.strength, Some(60));

        // Three invalid readings in a row keep the last value.
        for _ in 0..3 {
            smooth_signal(&mut sig, None);
            assert_eq!(sig.strength, Some(60));
        }
        // The fourth forces unknown.
        smooth_signal(&mut sig, None);
        assert_eq!(sig.strength, None);

        // A good reading afterwards recovers immediately.
        smooth_signal(&mut sig, Some((42, 5, 94)));
        assert_eq!(sig.strength, Some(42));
        assert_eq!(sig.invalid_reads, 0);
    }

    #[test]
    fn wep_key_parsing() {
        assert_eq!(
            parse_wep_key("deadbeef01"),
            Some(vec![0xde, 0xad, 0xbe, 0xef, 0x01])
        );
        assert_eq!(
            parse_wep_key("de:ad:be:ef:01"),
            Some(vec![0xde, 0xad, 0xbe, 0xef, 0x01])
        );
        assert_eq!(parse_wep_key("s:hello"), Some(b"hello".to_vec()));
        assert_eq!(parse_wep_key("xyz"), None);
        assert_eq!(parse_wep_key(""), None);
    }

    #[test]
    fn mode_raw_round_trip() {
        assert_eq!(mode_from_raw(IW_MODE_ADHOC), WirelessMode::AdHoc);
        assert_eq!(mode_from_raw(IW_MODE_INFRA), WirelessMode::Infrastructure);
        assert_eq!(mode_from_raw(99), WirelessMode::Unknown);
        assert_eq!(mode_to_raw(WirelessMode::AdHoc), IW_MODE_ADHOC);
        assert_eq!(mode_to_raw(WirelessMode::Infrastructure), IW_MODE_INFRA);
    }
}
