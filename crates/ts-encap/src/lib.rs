//! Multiplexes several input PIDs from a transport stream into one output
//! PID, either as a plain contiguous byte stream or wrapped in PES/KLV
//! (SMPTE-336M) envelopes, with optional PCR extrapolation from a
//! reference PID.
//!
//! In the output PID, packetization mirrors how sections are carried:
//! the PUSI bit marks a TS packet whose payload starts with a pointer
//! field pointing at the start of the next encapsulated unit. Input
//! packets are queued ("late packets") and drained into null packets
//! from the input stream, since the output needs more packets than the
//! input provides room for. Null packets (PID 0x1FFF) are themselves
//! never encapsulated, only used as carriers.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;
use ts_packet::{TsPacket, PACKET_SIZE, PID_NULL, SYNC_BYTE};

const CC_MASK: u8 = 0x0F;
const SYSTEM_CLOCK_FREQ: u128 = 27_000_000;
const MS_PER_SEC: u128 = 1_000;
/// PCR wraps at 2^42 (33-bit base, 9-bit extension already folded in).
const PCR_MASK: u64 = (1u64 << 42) - 1;

/// Private testing range UL key used to wrap KLV payloads in the PES
/// envelope (SMPTE-336M asynchronous encapsulation).
const KLVA_UL_KEY: [u8; 16] = [
    0x06, 0x0e, 0x2b, 0x34, 0x01, 0x01, 0x01, 0x01, 0x0f, 0x01, 0x08, 0x00, 0x0f, 0x0f, 0x0f, 0x0f,
];

/// Keep at least this many slots of headroom in the late-packet queue.
pub const DEFAULT_MAX_BUFFERED_PACKETS: usize = 1024;

/// PES/KLV envelope mode for the output PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PesMode {
    /// Plain encapsulation, no PES envelope.
    #[default]
    Disabled,
    /// Short (7-bit) BER length form; payload capped at 127 bytes so the
    /// PES envelope never needs the long length form.
    Fixed,
    /// BER length form chosen per packet; payload fills the outer packet.
    Variable,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncapError {
    #[error("PID conflict: output PID {0:#06x} is present on input but not encapsulated")]
    PidConflict(u16),
    #[error("buffered packets overflow, insufficient null packets in input stream")]
    BufferOverflow,
}

/// Multiplexes a set of input PIDs into a single output PID.
/// No cap on the distance between carrier emissions: packing waits for a
/// full payload no matter how long that takes.
pub const NO_PACK_DISTANCE: usize = usize::MAX;

pub struct Encapsulator {
    packing: bool,
    pack_distance: usize,
    packets_since_emit: usize,
    pes_mode: PesMode,
    pid_output: u16,
    pid_input: HashSet<u16>,
    pcr_reference: Option<u16>,
    pcr_last_packet: Option<u64>,
    pcr_last_value: Option<u64>,
    bitrate: u64,
    insert_pcr: bool,
    cc_output: u8,
    last_cc: HashMap<u16, u8>,
    late_max_packets: usize,
    late_index: usize,
    late_packets: VecDeque<TsPacket>,
    current_packet: u64,
}

impl Encapsulator {
    pub fn new(pid_output: u16) -> Self {
        Encapsulator {
            packing: false,
            pack_distance: NO_PACK_DISTANCE,
            packets_since_emit: 0,
            pes_mode: PesMode::Disabled,
            pid_output,
            pid_input: HashSet::new(),
            pcr_reference: None,
            pcr_last_packet: None,
            pcr_last_value: None,
            bitrate: 0,
            insert_pcr: false,
            cc_output: 0,
            last_cc: HashMap::new(),
            late_max_packets: DEFAULT_MAX_BUFFERED_PACKETS,
            late_index: 0,
            late_packets: VecDeque::new(),
            current_packet: 0,
        }
    }

    pub fn reset(&mut self, pid_output: u16) {
        let pes_mode = self.pes_mode;
        let packing = self.packing;
        let pack_distance = self.pack_distance;
        let late_max_packets = self.late_max_packets;
        *self = Encapsulator::new(pid_output);
        self.pes_mode = pes_mode;
        self.packing = packing;
        self.pack_distance = pack_distance;
        self.late_max_packets = late_max_packets;
    }

    pub fn output_pid(&self) -> u16 {
        self.pid_output
    }

    pub fn set_output_pid(&mut self, pid: u16) {
        if pid != self.pid_output {
            self.pid_output = pid;
            self.cc_output = 0;
            self.last_cc.clear();
            self.late_index = 0;
            self.late_packets.clear();
        }
    }

    pub fn input_pids(&self) -> &HashSet<u16> {
        &self.pid_input
    }

    pub fn pid_count(&self) -> usize {
        self.pid_input.len()
    }

    /// The null PID (0x1FFF) can never be encapsulated; silently ignored.
    pub fn add_input_pid(&mut self, pid: u16) {
        if pid != PID_NULL {
            self.pid_input.insert(pid);
        }
    }

    pub fn remove_input_pid(&mut self, pid: u16) {
        self.pid_input.remove(&pid);
    }

    pub fn set_input_pids(&mut self, pids: impl IntoIterator<Item = u16>) {
        self.pid_input = pids.into_iter().filter(|&p| p != PID_NULL).collect();
    }

    pub fn reference_pcr(&self) -> Option<u16> {
        self.pcr_reference
    }

    pub fn set_reference_pcr(&mut self, pid: Option<u16>) {
        if pid != self.pcr_reference {
            self.pcr_reference = pid;
            self.reset_pcr();
        }
    }

    /// Always keeps a margin of at least 8 slots.
    pub fn set_max_buffered_packets(&mut self, count: usize) {
        self.late_max_packets = count.max(8);
    }

    /// `pack_distance` bounds how many packets may elapse since the most
    /// recent emission before a not-yet-full carrier packet is forced out
    /// anyway, to keep worst-case latency bounded. Pass
    /// [`NO_PACK_DISTANCE`] for no such bound.
    pub fn set_packing(&mut self, on: bool, pack_distance: usize) {
        self.packing = on;
        self.pack_distance = pack_distance;
    }

    pub fn set_pes_mode(&mut self, mode: PesMode) {
        self.pes_mode = mode;
    }

    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }

    pub fn buffered_packets(&self) -> usize {
        self.late_packets.len()
    }

    fn reset_pcr(&mut self) {
        self.pcr_last_packet = None;
        self.pcr_last_value = None;
        self.bitrate = 0;
        self.insert_pcr = false;
    }

    /// Process one packet from the input stream in place. If it belongs
    /// to an input PID it is queued and the slot is immediately reused to
    /// drain the queue into an output-PID packet; null packets already in
    /// the stream are used the same way to drain whatever remains queued.
    pub fn process_packet(&mut self, pkt: &mut TsPacket) -> Result<(), EncapError> {
        let mut pid = pkt.pid();
        let mut result = Ok(());

        if pid != PID_NULL {
            let cc = pkt.cc();
            match self.last_cc.insert(pid, cc) {
                None => {}
                Some(prev) if cc == (prev + 1) & CC_MASK => {}
                Some(_) => self.reset_pcr(),
            }
        }

        if self.pcr_reference == Some(pid) {
            if let Some(pcr) = pkt.pcr() {
                if let Some(last_value) = self.pcr_last_value {
                    if last_value < pcr {
                        let ms = ((pcr - last_value) as u128 * MS_PER_SEC) / SYSTEM_CLOCK_FREQ;
                        let packets = self.current_packet - self.pcr_last_packet.unwrap();
                        self.bitrate = if ms == 0 {
                            0
                        } else {
                            ((packets as u128 * PACKET_SIZE as u128 * 8 * MS_PER_SEC) / ms) as u64
                        };
                        self.insert_pcr = true;
                    }
                }
                self.pcr_last_packet = Some(self.current_packet);
                self.pcr_last_value = Some(pcr);
            }
        }

        if pid == self.pid_output && !self.pid_input.contains(&pid) {
            result = Err(EncapError::PidConflict(pid));
        }

        if self.late_index < 1 {
            self.late_index = 1;
        }

        if self.pid_input.contains(&pid) && self.pid_output != PID_NULL {
            if self.late_packets.len() > self.late_max_packets {
                result = Err(EncapError::BufferOverflow);
            } else {
                self.late_packets.push_back(pkt.clone());
                if self.late_packets.len() == 1 {
                    self.late_index = 1;
                }
            }
            pid = PID_NULL;
        }

        if pid == PID_NULL && !self.late_packets.is_empty() {
            self.emit(pkt);
        }

        self.current_packet += 1;
        self.packets_since_emit += 1;
        result
    }

    fn emit(&mut self, pkt: &mut TsPacket) {
        let add_pcr = self.insert_pcr
            && self.bitrate != 0
            && self.pcr_last_packet.is_some()
            && self.pcr_last_value.is_some();

        let add_bytes =
            (PACKET_SIZE - self.late_index) + if self.late_packets.len() > 1 { PACKET_SIZE } else { 0 };

        let pes_header_len: u8 = match self.pes_mode {
            PesMode::Disabled => 0,
            PesMode::Fixed => 26,
            PesMode::Variable => {
                if add_bytes <= 127 {
                    26
                } else {
                    27
                }
            }
        };

        // Packing mode: skip emitting a not-yet-full outer packet, unless
        // pack_distance packets have elapsed since the last emission (bounds
        // worst-case latency at the cost of a partially-filled packet).
        let forced_by_distance = self.packing && self.packets_since_emit >= self.pack_distance;
        if self.packing && !forced_by_distance && add_bytes < PACKET_SIZE - if add_pcr { 12 } else { 4 } - 1 {
            return;
        }
        self.packets_since_emit = 0;

        {
            let bytes = pkt.as_bytes_mut();
            bytes[0] = SYNC_BYTE;
            bytes[1] = 0;
            bytes[2] = 0;
            bytes[3] = 0x10; // payload only, for now
            for b in bytes[4..].iter_mut() {
                *b = 0xFF;
            }
            bytes[4] = 0;
        }
        pkt.set_pid(self.pid_output);
        pkt.set_cc(self.cc_output);
        self.cc_output = (self.cc_output + 1) & CC_MASK;

        let mut pkt_index: usize = 4;

        if add_pcr {
            let pcr_last_value = self.pcr_last_value.unwrap();
            let pcr_last_packet = self.pcr_last_packet.unwrap();
            let packets_since = self.current_packet - pcr_last_packet;
            let pcr_distance = (packets_since as u128 * PACKET_SIZE as u128 * 8 * SYSTEM_CLOCK_FREQ)
                / self.bitrate as u128;
            let pcr = (pcr_last_value.wrapping_add(pcr_distance as u64)) & PCR_MASK;

            {
                let bytes = pkt.as_bytes_mut();
                bytes[3] |= 0x20;
                bytes[4] = 7;
                bytes[5] = 0x10;
            }
            pkt_index += 8;
            pkt.set_pcr(pcr)
                .expect("freshly built adaptation field always has PCR room");
            self.insert_pcr = false;
        }

        let af_len_now = pkt.af_len();
        let pes_maxsize: u8 = match self.pes_mode {
            PesMode::Disabled => 0,
            PesMode::Fixed => 127,
            PesMode::Variable => PACKET_SIZE as u8 - (af_len_now + 4) - pes_header_len,
        };
        let pes_stuff: u8 = if self.pes_mode == PesMode::Disabled {
            0
        } else {
            (PACKET_SIZE as u8 - (af_len_now + 4) - pes_header_len).saturating_sub(pes_maxsize)
        };

        if self.late_packets.len() == 1
            && self.late_index > pkt_index + pes_header_len as usize + pes_stuff as usize
        {
            let new_af_len = (self.late_index - 5 - pes_header_len as usize) as u8;
            let bytes = pkt.as_bytes_mut();
            bytes[3] |= 0x20;
            bytes[4] = new_af_len;
            if !add_pcr {
                bytes[5] = 0x00;
            }
            pkt_index = self.late_index - pes_header_len as usize;
        } else if pes_stuff > 0 {
            let bytes = pkt.as_bytes_mut();
            let new_af_len = bytes[4] + pes_stuff - 1;
            bytes[3] |= 0x20;
            bytes[4] = new_af_len;
            if !add_pcr {
                bytes[5] = 0x00;
            }
            pkt_index += pes_stuff as usize;
        }

        debug_assert_eq!(pkt_index, pkt.header_size());

        let mut pes_pointer: usize = 0;
        if pes_header_len > 0 {
            let bytes = pkt.as_bytes_mut();
            bytes[pkt_index] = 0x00;
            bytes[pkt_index + 1] = 0x00;
            bytes[pkt_index + 2] = 0x01;
            bytes[pkt_index + 3] = 0xBD; // stream_id: private_stream_1
            bytes[pkt_index + 4] = 0x00; // PES packet length, high byte (always 0, fits in low byte)
            bytes[pkt_index + 5] = 0x00; // low byte, filled below once its value is known
            pes_pointer = pkt_index + 6; // position of the header-flags byte, kept for later reference
            bytes[pkt_index + 6] = 0x84;
            bytes[pkt_index + 7] = 0x00;
            bytes[pkt_index + 8] = 0x00;
            bytes[pkt_index + 9..pkt_index + 9 + 16].copy_from_slice(&KLVA_UL_KEY);
            pkt_index += 25;

            let mut payload_size = (PACKET_SIZE - pkt_index - 1) as u8;
            if payload_size > 127 {
                bytes[pkt_index] = 0x81; // long BER length form, 1 length byte follows
                pkt_index += 1;
                payload_size -= 1;
            }
            bytes[pkt_index] = payload_size;
            pkt_index += 1;

            bytes[pes_pointer - 1] = (PACKET_SIZE - pes_pointer) as u8;
            pkt.set_pusi(true);
        }

        if self.late_index == 1 {
            if pes_header_len > 0 {
                pkt.as_bytes_mut()[pes_pointer + 18] |= 0x10;
            } else {
                pkt.set_pusi(true);
            }
            pkt.as_bytes_mut()[pkt_index] = 0;
            pkt_index += 1;
        } else if self.late_index > pkt_index + 1 && self.late_packets.len() > 1 {
            if pes_header_len > 0 {
                pkt.as_bytes_mut()[pes_pointer + 18] |= 0x10;
            } else {
                pkt.set_pusi(true);
            }
            pkt.as_bytes_mut()[pkt_index] = (PACKET_SIZE - self.late_index) as u8;
            pkt_index += 1;
        }

        self.fill_packet(pkt, &mut pkt_index);
        if pkt_index < PACKET_SIZE {
            self.fill_packet(pkt, &mut pkt_index);
        }
        debug_assert_eq!(pkt_index, PACKET_SIZE);
    }

    fn fill_packet(&mut self, pkt: &mut TsPacket, pkt_index: &mut usize) {
        let front = self
            .late_packets
            .front()
            .expect("fill_packet called with an empty late-packet queue");
        let size = (PACKET_SIZE - *pkt_index).min(PACKET_SIZE - self.late_index);
        let chunk: Vec<u8> = front.as_bytes()[self.late_index..self.late_index + size].to_vec();
        pkt.as_bytes_mut()[*pkt_index..*pkt_index + size].copy_from_slice(&chunk);
        *pkt_index += size;
        self.late_index += size;

        if self.late_index >= PACKET_SIZE {
            self.late_packets.pop_front();
            self.late_index = 1; // skip the dropped sync byte of the next queued packet
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_packet(pid: u16, cc: u8, fill: u8) -> TsPacket {
        let mut p = TsPacket::default();
        p.set_pid(pid);
        p.set_cc(cc);
        p.set_afc(0b01);
        p.as_bytes_mut()[4..].fill(fill);
        p
    }

    fn null_packet() -> TsPacket {
        TsPacket::default()
    }

    #[test]
    fn plain_mode_emits_immediately_into_null_slot() {
        let mut encap = Encapsulator::new(0x200);
        encap.add_input_pid(0x100);

        let mut pkt = input_packet(0x100, 0, 0xAA);
        encap.process_packet(&mut pkt).unwrap();

        assert_eq!(pkt.pid(), 0x200);
        assert!(pkt.pusi());
        assert_eq!(pkt.pointer_field(), Some(0));
        assert_eq!(encap.buffered_packets(), 1);
    }

    #[test]
    fn null_packets_drain_the_late_queue() {
        let mut encap = Encapsulator::new(0x200);
        encap.add_input_pid(0x100);

        let mut input = input_packet(0x100, 0, 0xAA);
        encap.process_packet(&mut input).unwrap();
        assert_eq!(encap.buffered_packets(), 1);

        // 187 bytes do not fit in one ~183-byte outer payload; a couple of
        // null packets are needed to fully drain the queue.
        for _ in 0..3 {
            if encap.buffered_packets() == 0 {
                break;
            }
            let mut filler = null_packet();
            encap.process_packet(&mut filler).unwrap();
            assert_eq!(filler.pid(), 0x200);
        }
        assert_eq!(encap.buffered_packets(), 0);
    }

    #[test]
    fn output_pid_present_uncapsulated_is_a_conflict() {
        let mut encap = Encapsulator::new(0x200);
        encap.add_input_pid(0x100);

        let mut foreign = TsPacket::default();
        foreign.set_pid(0x200);
        let err = encap.process_packet(&mut foreign).unwrap_err();
        assert_eq!(err, EncapError::PidConflict(0x200));
    }

    #[test]
    fn buffer_overflow_when_no_null_packets_available() {
        let mut encap = Encapsulator::new(0x200);
        encap.add_input_pid(0x100);
        encap.set_max_buffered_packets(8);

        let mut cc = 0u8;
        let mut last_err = None;
        for _ in 0..40 {
            let mut pkt = input_packet(0x100, cc, 0xAA);
            if let Err(e) = encap.process_packet(&mut pkt) {
                last_err = Some(e);
                break;
            }
            cc = (cc + 1) & 0x0F;
        }
        assert_eq!(last_err, Some(EncapError::BufferOverflow));
    }

    #[test]
    fn pes_fixed_mode_wraps_klv_envelope() {
        let mut encap = Encapsulator::new(0x300);
        encap.add_input_pid(0x100);
        encap.set_pes_mode(PesMode::Fixed);

        let mut pkt = input_packet(0x100, 0, 0xBB);
        encap.process_packet(&mut pkt).unwrap();

        assert_eq!(pkt.pid(), 0x300);
        assert!(pkt.pusi());
        // Fixed mode pads the adaptation field so the PES envelope starts
        // right where a 127-byte-capped payload will end exactly at the
        // packet boundary; with one queued packet and no PCR that lands
        // the PES start code at offset 35.
        let bytes = pkt.as_bytes();
        assert_eq!(pkt.header_size(), 35);
        assert_eq!(&bytes[35..39], &[0x00, 0x00, 0x01, 0xBD]);
        // KLVA UL key begins 9 bytes into the PES packet (header+flags).
        assert_eq!(&bytes[44..60], &KLVA_UL_KEY);
    }

    #[test]
    fn pid_conflict_does_not_prevent_continued_processing() {
        let mut encap = Encapsulator::new(0x200);
        encap.add_input_pid(0x100);

        let mut foreign = TsPacket::default();
        foreign.set_pid(0x200);
        assert!(encap.process_packet(&mut foreign).is_err());

        let mut pkt = input_packet(0x100, 0, 0xCC);
        assert!(encap.process_packet(&mut pkt).is_ok());
    }

    #[test]
    fn pack_distance_forces_a_partial_emission() {
        let mut encap = Encapsulator::new(0x200);
        encap.add_input_pid(0x100);
        encap.set_packing(true, 2);

        let mut pkt = input_packet(0x100, 0, 0xAA);
        encap.process_packet(&mut pkt).unwrap();
        assert_eq!(encap.buffered_packets(), 1, "packing should hold a not-yet-full packet");

        let mut filler1 = null_packet();
        encap.process_packet(&mut filler1).unwrap();
        assert_eq!(
            encap.buffered_packets(),
            1,
            "pack_distance not yet elapsed, still holding"
        );

        let mut filler2 = null_packet();
        encap.process_packet(&mut filler2).unwrap();
        assert_eq!(filler2.pid(), 0x200, "forced emission once pack_distance elapsed");
    }

    #[test]
    fn packing_without_distance_waits_for_a_full_packet() {
        let mut encap = Encapsulator::new(0x200);
        encap.add_input_pid(0x100);
        encap.set_packing(true, NO_PACK_DISTANCE);

        let mut pkt = input_packet(0x100, 0, 0xAA);
        encap.process_packet(&mut pkt).unwrap();
        for _ in 0..50 {
            let mut filler = null_packet();
            encap.process_packet(&mut filler).unwrap();
            if filler.pid() == 0x200 {
                return;
            }
        }
        assert_eq!(encap.buffered_packets(), 1, "one short packet never forces emission");
    }

    #[test]
    fn reference_pcr_estimates_bitrate() {
        let mut encap = Encapsulator::new(0x200);
        encap.add_input_pid(0x100);
        encap.set_reference_pcr(Some(0x50));

        let mut p1 = TsPacket::default();
        p1.set_pid(0x50);
        p1.set_pcr(1_000_000).unwrap();
        encap.process_packet(&mut p1).unwrap();

        for _ in 0..100 {
            let mut filler = null_packet();
            encap.process_packet(&mut filler).unwrap();
        }

        let mut p2 = TsPacket::default();
        p2.set_pid(0x50);
        p2.set_pcr(1_000_000 + 101 * 27_000).unwrap();
        encap.process_packet(&mut p2).unwrap();

        assert!(encap.bitrate() > 0);
    }
}
