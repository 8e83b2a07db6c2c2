//! Envelope invariants at the workspace level.

use serde_json::json;
use vj_bus::envelope::{Envelope, Payload, TelemetryPayload};

#[test]
fn decode_of_encode_is_identity() {
    let envelope = Envelope::new(
        "audio_analyzer",
        "inst-9",
        3,
        1_000_001,
        Payload::Telemetry(TelemetryPayload {
            stream: "features".into(),
            data: [
                ("rms".to_string(), json!(0.5)),
                ("bands".to_string(), json!([0.1, 0.2, 0.3])),
            ]
            .into_iter()
            .collect(),
        }),
    );

    let bytes = envelope.encode().unwrap();
    assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
}

#[test]
fn registry_concurrent_writers_leave_no_torn_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();

    let handles: Vec<_> = (0..8u64)
        .map(|writer| {
            let path = path.clone();
            std::thread::spawn(move || {
                let registry = vj_bus::Registry::open(&path).unwrap();
                for i in 0..20 {
                    let now = vj_bus::time::now_millis();
                    registry
                        .register(vj_bus::RegistryEntry {
                            worker: "contended".into(),
                            instance_id: format!("w{writer}-i{i}"),
                            generation: writer,
                            pid: 1,
                            command_endpoint: "tcp://127.0.0.1:1".into(),
                            telemetry_endpoint: "udp://127.0.0.1:2".into(),
                            event_endpoint: "tcp://127.0.0.1:3".into(),
                            started_at_ms: now,
                            heartbeat_at_ms: now,
                            status: vj_bus::WorkerStatus::Running,
                            metadata: Default::default(),
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // The surviving record parses and is one of the complete writes
    let registry = vj_bus::Registry::open(&path).unwrap();
    let entry = registry.get("contended").unwrap().unwrap();
    assert!(entry.instance_id.starts_with('w'));
    // Generations only ever go up under concurrent replacement
    assert_eq!(entry.generation, 7);
}
