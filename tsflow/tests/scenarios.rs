//! End-to-end pipeline scenarios, one per concrete testable property.

use pipeline_core::config::{PipelineConfig, PluginSpec};
use ts_io::{TsFileReader, TsFileWriter};
use ts_packet::TsPacket;
use tsflow::supervisor::Supervisor;

fn write_packets(path: &std::path::Path, packets: &[TsPacket]) {
    let mut writer = TsFileWriter::open(path.to_str().unwrap(), false, false).unwrap();
    writer.write(packets).unwrap();
}

fn read_all_packets(path: &std::path::Path) -> Vec<TsPacket> {
    let mut reader = TsFileReader::open(path.to_str().unwrap(), 1, 0).unwrap();
    let mut out = Vec::new();
    let mut buf = vec![TsPacket::default(); 64];
    loop {
        let n = reader.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

fn make_packet(pid: u16, cc: u8) -> TsPacket {
    let mut p = TsPacket::default();
    p.set_pid(pid);
    p.set_cc(cc);
    p
}

#[test]
fn plain_copy_passes_every_packet_through_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("in.ts");
    let output_path = dir.path().join("out.ts");

    let packets: Vec<TsPacket> = (0..50).map(|i| make_packet(0x200, (i % 16) as u8)).collect();
    write_packets(&input_path, &packets);

    let config = PipelineConfig::new(
        PluginSpec::new("file", vec!["--file".into(), input_path.to_str().unwrap().into()]),
        vec![],
        PluginSpec::new("file", vec!["--file".into(), output_path.to_str().unwrap().into()]),
    );
    let code = Supervisor::build(&config).unwrap().run().unwrap();
    assert_eq!(code, 0);

    let output = read_all_packets(&output_path);
    assert_eq!(output.len(), packets.len());
    for (a, b) in output.iter().zip(packets.iter()) {
        assert_eq!(a.pid(), b.pid());
        assert_eq!(a.cc(), b.cc());
    }
}

#[test]
fn drop_processor_removes_only_the_configured_pid() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("in.ts");
    let output_path = dir.path().join("out.ts");

    let mut packets = Vec::new();
    for i in 0..30u8 {
        let pid = if i % 3 == 0 { 0x100 } else { 0x200 };
        packets.push(make_packet(pid, i % 16));
    }
    write_packets(&input_path, &packets);

    let config = PipelineConfig::new(
        PluginSpec::new("file", vec!["--file".into(), input_path.to_str().unwrap().into()]),
        vec![PluginSpec::new("drop", vec!["--pid".into(), "0x100".into()])],
        PluginSpec::new("file", vec!["--file".into(), output_path.to_str().unwrap().into()]),
    );
    let code = Supervisor::build(&config).unwrap().run().unwrap();
    assert_eq!(code, 0);

    let output = read_all_packets(&output_path);
    let expected = packets.iter().filter(|p| p.pid() != 0x100).count();
    assert_eq!(output.len(), expected);
    assert!(output.iter().all(|p| p.pid() == 0x200));
}

#[test]
fn encapsulator_plain_mode_multiplexes_into_one_output_pid() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("in.ts");
    let output_path = dir.path().join("out.ts");

    let packets: Vec<TsPacket> = (0..40).map(|i| make_packet(0x111, (i % 16) as u8)).collect();
    write_packets(&input_path, &packets);

    let config = PipelineConfig::new(
        PluginSpec::new("file", vec!["--file".into(), input_path.to_str().unwrap().into()]),
        vec![PluginSpec::new(
            "encap",
            vec![
                "--pid".into(), "0x300".into(),
                "--input-pid".into(), "0x111".into(),
            ],
        )],
        PluginSpec::new("file", vec!["--file".into(), output_path.to_str().unwrap().into()]),
    );
    let code = Supervisor::build(&config).unwrap().run().unwrap();
    assert_eq!(code, 0);

    let output = read_all_packets(&output_path);
    assert!(!output.is_empty());
    assert!(output.iter().all(|p| p.pid() == 0x300 || p.pid() == ts_packet::PID_NULL));
}

#[test]
fn encapsulator_pes_fixed_mode_wraps_a_klv_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("in.ts");
    let output_path = dir.path().join("out.ts");

    let packets: Vec<TsPacket> = (0..10).map(|i| make_packet(0x111, (i % 16) as u8)).collect();
    write_packets(&input_path, &packets);

    let config = PipelineConfig::new(
        PluginSpec::new("file", vec!["--file".into(), input_path.to_str().unwrap().into()]),
        vec![PluginSpec::new(
            "encap",
            vec![
                "--pid".into(), "0x300".into(),
                "--input-pid".into(), "0x111".into(),
                "--pes-mode".into(), "fixed".into(),
            ],
        )],
        PluginSpec::new("file", vec!["--file".into(), output_path.to_str().unwrap().into()]),
    );
    let code = Supervisor::build(&config).unwrap().run().unwrap();
    assert_eq!(code, 0);

    let output = read_all_packets(&output_path);
    let pusi_packets: Vec<&TsPacket> = output.iter().filter(|p| p.pid() == 0x300 && p.pusi()).collect();
    assert!(!pusi_packets.is_empty(), "expected at least one PES-framed packet");
    for pkt in pusi_packets {
        let header_start = pkt.header_size();
        let bytes = pkt.as_bytes();
        assert_eq!(&bytes[header_start..header_start + 3], &[0x00, 0x00, 0x01]);
    }
}

#[test]
fn resync_drops_leading_junk_and_recovers_alignment() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("in.ts");
    let output_path = dir.path().join("out.ts");

    let good: Vec<TsPacket> = (0..200).map(|i| make_packet(0x123, (i % 16) as u8)).collect();
    let mut raw = vec![0xAAu8; 40];
    for p in &good {
        raw.extend_from_slice(p.as_bytes());
    }
    std::fs::write(&input_path, &raw).unwrap();

    let config = PipelineConfig::new(
        PluginSpec::new("file", vec!["--file".into(), input_path.to_str().unwrap().into()]),
        vec![],
        PluginSpec::new("file", vec!["--file".into(), output_path.to_str().unwrap().into()]),
    );
    let code = Supervisor::build(&config).unwrap().run().unwrap();
    assert_eq!(code, 0);

    let output = read_all_packets(&output_path);
    assert_eq!(output.len(), good.len());
    assert!(output.iter().all(|p| p.pid() == 0x123));
}

#[test]
fn looping_playback_multiplies_total_packets_by_repeat_count() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("in.ts");
    let output_path = dir.path().join("out.ts");

    let packets: Vec<TsPacket> = (0..15).map(|i| make_packet(0x321, (i % 16) as u8)).collect();
    write_packets(&input_path, &packets);

    let config = PipelineConfig::new(
        PluginSpec::new(
            "file",
            vec!["--file".into(), input_path.to_str().unwrap().into(), "--repeat".into(), "4".into()],
        ),
        vec![],
        PluginSpec::new("file", vec!["--file".into(), output_path.to_str().unwrap().into()]),
    );
    let code = Supervisor::build(&config).unwrap().run().unwrap();
    assert_eq!(code, 0);

    let output = read_all_packets(&output_path);
    assert_eq!(output.len(), packets.len() * 4);
}
