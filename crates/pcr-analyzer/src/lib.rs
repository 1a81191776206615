//! Per-PID running estimate of transport stream bitrate from PCR (or DTS)
//! deltas, with continuity-counter based discontinuity detection.
//!
//! The algorithm (including the exact field names translated below) is
//! taken directly from TSDuck's `PCRAnalyzer`: a running sum of
//! per-sample bitrate estimates is kept both globally and per PID, and a
//! "valid" bitrate is only reported once enough PIDs have each
//! accumulated enough PCR samples.

use std::collections::HashMap;

use ts_packet::TsPacket;

/// 27 MHz system clock frequency used by PCR.
const SYSTEM_CLOCK_FREQ: u128 = 27_000_000;
/// 90 kHz to 27 MHz conversion factor applied to DTS values in DTS mode.
const DTS_TO_27MHZ: u64 = 300;
/// Standard TS packet size in bytes.
const PKT_SIZE: u128 = 188;
/// Reed-Solomon-framed TS packet size in bytes.
const PKT_RS_SIZE: u128 = 204;

#[derive(Default, Clone, Copy)]
struct PidAnalysis {
    ts_pkt_cnt: u64,
    cur_continuity: u8,
    last_pcr_value: u64,
    last_pcr_packet: u64,
    ts_bitrate_188: u64,
    ts_bitrate_204: u64,
    ts_bitrate_cnt: u64,
}

/// Estimates transport stream bitrate from PCR (or DTS) timestamps spread
/// across a configurable minimum number of PIDs.
pub struct PcrAnalyzer {
    use_dts: bool,
    ignore_errors: bool,
    min_pid: usize,
    min_pcr_per_pid: usize,
    bitrate_valid: bool,
    ts_pkt_cnt: u64,
    ts_bitrate_188: u64,
    ts_bitrate_204: u64,
    ts_bitrate_cnt: u64,
    completed_pids: usize,
    pcr_pids: usize,
    per_pid: HashMap<u16, PidAnalysis>,
}

impl Default for PcrAnalyzer {
    fn default() -> Self {
        Self::new(1, 64)
    }
}

impl PcrAnalyzer {
    /// Create an analyzer requiring `min_pid` PIDs (each with at least
    /// `min_pcr_per_pid` PCR samples) before reporting a valid bitrate.
    /// Both minimums are clamped up to 1.
    pub fn new(min_pid: usize, min_pcr_per_pid: usize) -> Self {
        PcrAnalyzer {
            use_dts: false,
            ignore_errors: false,
            min_pid: min_pid.max(1),
            min_pcr_per_pid: min_pcr_per_pid.max(1),
            bitrate_valid: false,
            ts_pkt_cnt: 0,
            ts_bitrate_188: 0,
            ts_bitrate_204: 0,
            ts_bitrate_cnt: 0,
            completed_pids: 0,
            pcr_pids: 0,
            per_pid: HashMap::new(),
        }
    }

    /// Discard all collected state, optionally changing the thresholds.
    pub fn reset(&mut self, min_pid: usize, min_pcr_per_pid: usize) {
        *self = PcrAnalyzer {
            use_dts: self.use_dts,
            ..PcrAnalyzer::new(min_pid, min_pcr_per_pid)
        };
    }

    /// Switch to DTS mode: DTS (at 90 kHz) replaces PCR (at 27 MHz) as the
    /// timing source, scaled by 300 to stay in 27 MHz ticks.
    pub fn use_dts(&mut self, enable: bool) {
        self.use_dts = enable;
    }

    /// When set, a lost sync byte does not invalidate collected PCR state.
    pub fn set_ignore_errors(&mut self, ignore: bool) {
        self.ignore_errors = ignore;
    }

    fn process_discontinuity(&mut self) {
        for ps in self.per_pid.values_mut() {
            ps.last_pcr_value = 0;
        }
    }

    /// Feed one packet into the analyzer. Returns whether a valid bitrate
    /// estimate is now available.
    pub fn feed(&mut self, pkt: &TsPacket) -> bool {
        self.ts_pkt_cnt += 1;

        if !self.ignore_errors && !pkt.sync_valid() {
            self.process_discontinuity();
            return self.bitrate_valid;
        }

        let pid = pkt.pid();
        let ps = self.per_pid.entry(pid).or_default();
        ps.ts_pkt_cnt += 1;

        let mut broken = false;
        if !self.ignore_errors {
            let cc = pkt.cc();
            let ps = self.per_pid.get_mut(&pid).unwrap();
            if ps.ts_pkt_cnt == 1 {
                ps.cur_continuity = cc;
            } else if pkt.discontinuity_indicator() {
                broken = true;
            } else if pkt.has_payload() {
                let next = (ps.cur_continuity + 1) & 0x0F;
                broken = cc != ps.cur_continuity && cc != next;
            } else if cc != ps.cur_continuity {
                broken = true;
            }
            ps.cur_continuity = cc;
        }
        if broken {
            tracing::trace!(pid, "PCR analyzer: CC discontinuity, invalidating PCR state");
            self.process_discontinuity();
        }

        let sample = if self.use_dts {
            extract_dts(pkt).map(|d| d * DTS_TO_27MHZ)
        } else {
            pkt.pcr()
        };

        if let Some(value) = sample {
            let ts_pkt_cnt = self.ts_pkt_cnt;
            let ps = self.per_pid.get_mut(&pid).unwrap();
            if ps.last_pcr_value != 0 && ps.last_pcr_value < value {
                let packets_since = (ts_pkt_cnt - ps.last_pcr_packet) as u128;
                let delta = (value - ps.last_pcr_value) as u128;
                let bitrate_188 = (packets_since * SYSTEM_CLOCK_FREQ * PKT_SIZE * 8) / delta;
                let bitrate_204 = (packets_since * SYSTEM_CLOCK_FREQ * PKT_RS_SIZE * 8) / delta;

                ps.ts_bitrate_188 += bitrate_188 as u64;
                ps.ts_bitrate_204 += bitrate_204 as u64;
                ps.ts_bitrate_cnt += 1;
                if ps.ts_bitrate_cnt == 1 {
                    self.pcr_pids += 1;
                }

                self.ts_bitrate_188 += bitrate_188 as u64;
                self.ts_bitrate_204 += bitrate_204 as u64;
                self.ts_bitrate_cnt += 1;

                if ps.ts_bitrate_cnt as usize == self.min_pcr_per_pid {
                    self.completed_pids += 1;
                    self.bitrate_valid = self.completed_pids >= self.min_pid;
                }
            }
            if ps.last_pcr_value != value {
                ps.last_pcr_value = value;
                ps.last_pcr_packet = ts_pkt_cnt;
            }
        }

        self.bitrate_valid
    }

    /// Whether enough samples have been collected to trust the aggregate
    /// bitrate estimates.
    pub fn bitrate_valid(&self) -> bool {
        self.bitrate_valid
    }

    /// Aggregate bitrate estimate in bits/second, assuming 188-byte packets.
    pub fn bitrate_188(&self) -> u64 {
        if self.ts_bitrate_cnt == 0 {
            0
        } else {
            self.ts_bitrate_188 / self.ts_bitrate_cnt
        }
    }

    /// Aggregate bitrate estimate in bits/second, assuming 204-byte
    /// Reed-Solomon-framed packets.
    pub fn bitrate_204(&self) -> u64 {
        if self.ts_bitrate_cnt == 0 {
            0
        } else {
            self.ts_bitrate_204 / self.ts_bitrate_cnt
        }
    }

    /// Per-PID bitrate estimate in bits/second (188-byte packets),
    /// weighted by that PID's share of total traffic.
    pub fn bitrate_188_for(&self, pid: u16) -> u64 {
        let total_packets = self.ts_pkt_cnt;
        match self.per_pid.get(&pid) {
            Some(ps) if self.ts_bitrate_cnt != 0 && total_packets != 0 => {
                ((self.ts_bitrate_188 as u128 * ps.ts_pkt_cnt as u128)
                    / (self.ts_bitrate_cnt as u128 * total_packets as u128)) as u64
            }
            _ => 0,
        }
    }

    /// Per-PID bitrate estimate in bits/second (204-byte packets).
    pub fn bitrate_204_for(&self, pid: u16) -> u64 {
        let total_packets = self.ts_pkt_cnt;
        match self.per_pid.get(&pid) {
            Some(ps) if self.ts_bitrate_cnt != 0 && total_packets != 0 => {
                ((self.ts_bitrate_204 as u128 * ps.ts_pkt_cnt as u128)
                    / (self.ts_bitrate_cnt as u128 * total_packets as u128)) as u64
            }
            _ => 0,
        }
    }

    /// Number of packets seen on `pid`.
    pub fn packet_count(&self, pid: u16) -> u64 {
        self.per_pid.get(&pid).map(|ps| ps.ts_pkt_cnt).unwrap_or(0)
    }

    /// Total packets fed into the analyzer.
    pub fn total_packets(&self) -> u64 {
        self.ts_pkt_cnt
    }

    /// Total number of PCR (or DTS) samples used in the aggregate estimate.
    pub fn sample_count(&self) -> u64 {
        self.ts_bitrate_cnt
    }
}

/// `true` if `stream_id` carries the optional PES header (hence PTS/DTS
/// fields may be present). Mirrors ISO/IEC 13818-1 Table 2-18.
fn has_optional_pes_header(stream_id: u8) -> bool {
    !matches!(
        stream_id,
        0xBC
        | 0xBE
        | 0xBF
        | 0xF0
        | 0xF1
        | 0xFF
        | 0xF2
        | 0xF8
    )
}

fn parse_pes_timestamp(data: &[u8]) -> Option<u64> {
    if data.len() < 5 {
        return None;
    }
    Some(
        (((data[0] as u64 >> 1) & 0x07) << 30)
            | ((data[1] as u64) << 22)
            | (((data[2] as u64 >> 1) & 0x7F) << 15)
            | ((data[3] as u64) << 7)
            | ((data[4] as u64 >> 1) & 0x7F),
    )
}

/// Pull a DTS value out of a PES header at the start of `pkt`'s payload,
/// if this packet starts a PES unit whose optional header carries both
/// PTS and DTS.
fn extract_dts(pkt: &TsPacket) -> Option<u64> {
    if !pkt.pusi() {
        return None;
    }
    let payload = pkt.payload()?;
    if payload.len() < 19 || payload[0] != 0 || payload[1] != 0 || payload[2] != 1 {
        return None;
    }
    let stream_id = payload[3];
    if !has_optional_pes_header(stream_id) {
        return None;
    }
    let pts_dts_flags = (payload[7] >> 6) & 0x03;
    if pts_dts_flags != 0b11 {
        return None;
    }
    parse_pes_timestamp(&payload[14..19])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_with_pcr(pid: u16, cc: u8, pcr_27mhz: u64) -> TsPacket {
        let mut p = TsPacket::default();
        p.set_pid(pid);
        p.set_cc(cc);
        p.set_pcr(pcr_27mhz).unwrap();
        p
    }

    #[test]
    fn bitrate_converges_on_constant_rate_stream() {
        let mut analyzer = PcrAnalyzer::new(1, 8);
        // 10 Mb/s stream: 27MHz PCR ticks per packet = 188*8*27_000_000 / bitrate.
        let bitrate: u128 = 10_000_000;
        let ticks_per_packet = (188u128 * 8 * 27_000_000) / bitrate;

        let mut pcr: u64 = 1;
        let mut cc = 0u8;
        let mut valid = false;
        for _ in 0..200 {
            let pkt = packet_with_pcr(0x100, cc, pcr);
            valid = analyzer.feed(&pkt) || valid;
            pcr += ticks_per_packet as u64;
            cc = (cc + 1) & 0x0F;
        }

        assert!(analyzer.bitrate_valid());
        let estimate = analyzer.bitrate_188() as f64;
        let target = bitrate as f64;
        assert!((estimate - target).abs() / target < 0.01, "estimate={estimate} target={target}");
    }

    #[test]
    fn discontinuity_without_indicator_invalidates_pcr() {
        let mut analyzer = PcrAnalyzer::new(1, 2);
        let p1 = packet_with_pcr(0x100, 0, 1_000_000);
        analyzer.feed(&p1);
        // Skip a continuity counter without setting the discontinuity flag.
        let p2 = packet_with_pcr(0x100, 5, 2_000_000);
        analyzer.feed(&p2);
        // PCR state was invalidated, so this sample starts fresh: not enough
        // samples yet for min_pcr_per_pid=2.
        assert!(!analyzer.bitrate_valid());
    }

    #[test]
    fn invalid_sync_byte_invalidates_all_pids() {
        let mut analyzer = PcrAnalyzer::new(1, 1);
        let good = packet_with_pcr(0x100, 0, 1_000_000);
        analyzer.feed(&good);

        let mut corrupt = TsPacket::default();
        corrupt.as_bytes_mut()[0] = 0x00;
        analyzer.feed(&corrupt);

        let next = packet_with_pcr(0x100, 1, 2_000_000);
        // last_pcr_value was cleared, so this does not produce a sample yet.
        assert!(!analyzer.feed(&next));
    }

    #[test]
    fn per_pid_bitrate_is_proportional() {
        let mut analyzer = PcrAnalyzer::new(1, 4);
        let ticks_per_packet = (188u128 * 8 * 27_000_000 / 10_000_000) as u64;
        let mut pcr = 1u64;
        let mut cc = 0u8;
        for _ in 0..40 {
            let pkt = packet_with_pcr(0x200, cc, pcr);
            analyzer.feed(&pkt);
            pcr += ticks_per_packet;
            cc = (cc + 1) & 0x0F;
        }
        assert!(analyzer.bitrate_188_for(0x200) > 0);
        assert_eq!(analyzer.bitrate_188_for(0x999), 0);
    }
}
