//! Seed spec: the analyzer driven by a synthetic input stream publishes
//! high-rate features and the legacy OSC surface, beats included.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use serial_test::serial;

use crate::prelude::*;
use vj_analyzer::analyzer::AnalyzerWorker;
use vj_worker::WorkerBuilder;

/// 4 seconds of 44.1 kHz mono: a 50 ms 440 Hz burst every 0.5 s (120 BPM)
/// over near-silence.
fn write_beat_wav(path: &std::path::Path) {
    let rate = 44_100u32;
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let total = rate as usize * 4;
    let period = rate as usize / 2;
    let burst = rate as usize / 20;
    for i in 0..total {
        let in_burst = i % period < burst;
        let sample = if in_burst {
            0.9 * (std::f32::consts::TAU * 440.0 * i as f32 / rate as f32).sin()
        } else {
            0.002 * ((i % 31) as f32 / 31.0 - 0.5)
        };
        writer
            .write_sample((sample * i16::MAX as f32) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn synthetic_input_produces_features_and_osc_beats() {
    let env = BusEnv::new();
    let wav_path = env.state_dir().join("beats.wav");
    write_beat_wav(&wav_path);

    // Receive the legacy OSC surface on an ephemeral port
    let osc_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let osc_port = osc_socket.local_addr().unwrap().port();

    let mut config = vj_analyzer::analyzer::default_config(wav_path.to_str());
    config.insert("osc_port".into(), json!(osc_port));

    let runtime = WorkerBuilder::new("audio_analyzer")
        .default_config(config)
        .start()
        .await
        .unwrap();
    let pipeline_handle = runtime.handle();
    tokio::spawn(async move {
        AnalyzerWorker::run(pipeline_handle).await;
    });

    // Count features telemetry for two seconds
    let client = env.client();
    let frames = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&frames);
    client.subscribe_telemetry("audio_analyzer", Some("features".into()), move |_envelope| {
        sink.fetch_add(1, Ordering::SeqCst);
    });

    assert!(
        wait_until(SPEC_WAIT, || frames.load(Ordering::SeqCst) > 0).await,
        "no features telemetry arrived"
    );
    let before = frames.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;
    let rate = (frames.load(Ordering::SeqCst) - before) / 2;
    assert!(rate >= 40, "features rate {rate} Hz, expected >= 40");

    // Drain OSC datagrams: the full address table flows, and the burst
    // train produces /beat = 1 messages
    let addresses: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let beat_seen = Arc::new(AtomicUsize::new(0));
    {
        let addresses = Arc::clone(&addresses);
        let beat_seen = Arc::clone(&beat_seen);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            while let Ok(len) = osc_socket.recv(&mut buf).await {
                if let Ok((_, rosc::OscPacket::Message(message))) =
                    rosc::decoder::decode_udp(&buf[..len])
                {
                    if message.addr == "/beat" {
                        if let Some(rosc::OscType::Float(value)) = message.args.first() {
                            if *value >= 1.0 {
                                beat_seen.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                    addresses.lock().push(message.addr);
                }
            }
        });
    }

    assert!(
        wait_until(SPEC_WAIT, || beat_seen.load(Ordering::SeqCst) >= 2).await,
        "no beats detected from the synthetic burst train"
    );
    let seen = addresses.lock().clone();
    for addr in ["/audio/levels", "/audio/spectrum", "/audio/bpm", "/energy"] {
        assert!(
            seen.iter().any(|a| a == addr),
            "missing OSC address {addr}"
        );
    }

    client.stop().await;
    runtime.finish(vj_worker::RunOutcome::Shutdown).await;
}
