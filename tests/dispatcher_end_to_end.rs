//! End-to-end dispatcher scenarios through the public API:
//! metadata registration, republished provenance, frame transforms.

use cpsens_stream::stream::codec::build_payload;
use cpsens_stream::transform::{IntegrationOutput, KalmanTuning};
use cpsens_stream::{
    Dispatcher, ElementType, Frame, Outcome, SampleCount, Stage, StreamError, StreamKey,
};
use serde_json::{json, Value};

const RAW_META: &[u8] = br#"{"Data":{"Samples":4,"Type":"f"},"Analysis chain":[]}"#;

const ACC_META: &[u8] = br#"{
    "Data": {"Samples": -1, "Type": "d", "Unit": "m/s^2"},
    "Analysis chain": [{"Name": "Acquisition", "Sampling": 100}]
}"#;

fn decode_output(payload: &[u8], count: SampleCount, element: ElementType) -> Frame {
    Frame::decode(payload, count, element).unwrap()
}

#[test]
fn test_detrend_reference_scenario() {
    let mut dispatcher = Dispatcher::new(Stage::detrend());

    let handled = dispatcher
        .handle_message("cpsns/s/n/ch1/raw/metadata", RAW_META)
        .unwrap();
    assert_eq!(handled.outcome, Outcome::MetadataPublished { created: true });
    assert_eq!(handled.messages.len(), 1);
    assert_eq!(handled.messages[0].topic, "cpsns/s/n/ch1/detrend/metadata");

    let doc: Value = serde_json::from_slice(&handled.messages[0].payload).unwrap();
    assert_eq!(
        doc["Analysis chain"],
        json!([{"Name": "Detrend", "Output": "detrended"}])
    );
    assert_eq!(doc["Data"]["Samples"], 4);

    let data = build_payload(4, 1, ElementType::Float32, &[10.0, 10.0, 10.0, 10.0]);
    let handled = dispatcher
        .handle_message("cpsns/s/n/ch1/raw/data", &data)
        .unwrap();
    assert_eq!(handled.outcome, Outcome::FramePublished { samples: 4 });
    assert_eq!(handled.messages[0].topic, "cpsns/s/n/ch1/detrend/data");

    let out = &handled.messages[0].payload;
    assert_eq!(out.len(), data.len());
    assert_eq!(&out[..4], &[4, 0, 1, 0]);
    let frame = decode_output(out, SampleCount::Fixed(4), ElementType::Float32);
    assert_eq!(frame.samples, vec![0.0; 4]);
}

#[test]
fn test_detrend_constant_signal_stays_zero_across_frames() {
    let mut dispatcher = Dispatcher::new(Stage::detrend());
    dispatcher
        .handle_message("cpsns/s/n/ch1/raw/metadata", RAW_META)
        .unwrap();

    for _ in 0..5 {
        let data = build_payload(4, 1, ElementType::Float32, &[-3.5; 4]);
        let handled = dispatcher
            .handle_message("cpsns/s/n/ch1/raw/data", &data)
            .unwrap();
        let frame = decode_output(
            &handled.messages[0].payload,
            SampleCount::Fixed(4),
            ElementType::Float32,
        );
        for s in frame.samples {
            assert!(s.abs() < 1e-6, "expected ~0, got {}", s);
        }
    }
}

#[test]
fn test_detrend_keeps_header_bytes_and_drops_trailing_bytes() {
    let mut dispatcher = Dispatcher::new(Stage::detrend());
    dispatcher
        .handle_message("cpsns/s/n/ch1/raw/metadata", RAW_META)
        .unwrap();

    // 8-byte descriptor with opaque trailing header content
    let mut data = build_payload(8, 3, ElementType::Float32, &[1.0, 2.0, 3.0, 4.0]);
    data[4..8].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    let expected_header = data[..8].to_vec();
    data.extend_from_slice(&[0xff, 0xff]);

    let handled = dispatcher
        .handle_message("cpsns/s/n/ch1/raw/data", &data)
        .unwrap();
    let out = &handled.messages[0].payload;
    assert_eq!(out.len(), 8 + 4 * 4);
    assert_eq!(&out[..8], expected_header.as_slice());
}

#[test]
fn test_streams_are_independent() {
    let mut dispatcher = Dispatcher::new(Stage::detrend());
    dispatcher
        .handle_message("cpsns/s/n/ch1/raw/metadata", RAW_META)
        .unwrap();
    dispatcher
        .handle_message("cpsns/s/n/ch2/raw/metadata", RAW_META)
        .unwrap();

    let ones = build_payload(4, 1, ElementType::Float32, &[1.0; 4]);
    dispatcher
        .handle_message("cpsns/s/n/ch1/raw/data", &ones)
        .unwrap();

    // ch2 is seeded by its own first sample, not ch1's history
    let fives = build_payload(4, 1, ElementType::Float32, &[5.0; 4]);
    let handled = dispatcher
        .handle_message("cpsns/s/n/ch2/raw/data", &fives)
        .unwrap();
    let frame = decode_output(
        &handled.messages[0].payload,
        SampleCount::Fixed(4),
        ElementType::Float32,
    );
    assert_eq!(frame.samples, vec![0.0; 4]);
    assert_eq!(dispatcher.registry().len(), 2);
}

#[test]
fn test_data_before_metadata_produces_nothing() {
    let mut dispatcher = Dispatcher::new(Stage::detrend());
    let data = build_payload(4, 1, ElementType::Float32, &[10.0; 4]);

    let handled = dispatcher
        .handle_message("cpsns/s/n/ch1/raw/data", &data)
        .unwrap();
    assert_eq!(handled.outcome, Outcome::DroppedUnknownKey);
    assert!(handled.messages.is_empty());
    assert!(!dispatcher
        .registry()
        .contains(&StreamKey::new(["cpsns", "s", "n", "ch1", "raw"])));
}

#[test]
fn test_duplicate_metadata_does_not_append_second_record() {
    let mut dispatcher = Dispatcher::new(Stage::detrend());
    dispatcher
        .handle_message("cpsns/s/n/ch1/raw/metadata", RAW_META)
        .unwrap();
    let handled = dispatcher
        .handle_message("cpsns/s/n/ch1/raw/metadata", RAW_META)
        .unwrap();

    assert_eq!(handled.outcome, Outcome::MetadataPublished { created: false });
    let doc: Value = serde_json::from_slice(&handled.messages[0].payload).unwrap();
    assert_eq!(doc["Analysis chain"].as_array().unwrap().len(), 1);
    assert_eq!(dispatcher.stats().streams_created, 1);
    assert_eq!(dispatcher.stats().metadata_published, 2);
}

#[test]
fn test_integrate_publishes_displacement() {
    let mut dispatcher = Dispatcher::new(Stage::integrate(KalmanTuning::default()));

    let handled = dispatcher
        .handle_message("cpsns/s/n/ch1/acc/metadata", ACC_META)
        .unwrap();
    assert_eq!(handled.messages[0].topic, "cpsns/s/n/ch1/displ/metadata");

    let doc: Value = serde_json::from_slice(&handled.messages[0].payload).unwrap();
    assert_eq!(doc["Data"]["Unit"], "m");
    assert_eq!(
        doc["Analysis chain"][1],
        json!({"Name": "Integration", "Output": "displacement"})
    );

    let data = build_payload(4, 1, ElementType::Float64, &[0.0; 16]);
    let handled = dispatcher
        .handle_message("cpsns/s/n/ch1/acc/data", &data)
        .unwrap();
    assert_eq!(handled.outcome, Outcome::FramePublished { samples: 16 });
    assert_eq!(handled.messages[0].topic, "cpsns/s/n/ch1/displ/data");

    let out = &handled.messages[0].payload;
    assert_eq!(out.len(), data.len());
    let frame = decode_output(out, SampleCount::Derived, ElementType::Float64);
    assert_eq!(frame.samples.len(), 16);
    assert!(frame.samples.iter().all(|s| *s == 0.0));
}

#[test]
fn test_integrate_velocity_output() {
    let tuning = KalmanTuning {
        output: IntegrationOutput::Velocity,
        ..KalmanTuning::default()
    };
    let mut dispatcher = Dispatcher::new(Stage::integrate(tuning));

    let handled = dispatcher
        .handle_message("cpsns/s/n/ch1/acc/metadata", ACC_META)
        .unwrap();
    assert_eq!(handled.messages[0].topic, "cpsns/s/n/ch1/vel/metadata");
    let doc: Value = serde_json::from_slice(&handled.messages[0].payload).unwrap();
    assert_eq!(doc["Data"]["Unit"], "m/s");
    assert_eq!(doc["Analysis chain"][1]["Output"], "velocity");

    let data = build_payload(4, 1, ElementType::Float64, &[1.0; 10]);
    let handled = dispatcher
        .handle_message("cpsns/s/n/ch1/acc/data", &data)
        .unwrap();
    assert_eq!(handled.messages[0].topic, "cpsns/s/n/ch1/vel/data");
    let frame = decode_output(
        &handled.messages[0].payload,
        SampleCount::Derived,
        ElementType::Float64,
    );
    assert_eq!(frame.samples.len(), 10);
    assert!(frame.samples.iter().all(|s| s.is_finite()));
}

#[test]
fn test_integrate_requires_sampling_rate() {
    let mut dispatcher = Dispatcher::new(Stage::integrate(KalmanTuning::default()));
    let err = dispatcher
        .handle_message("cpsns/s/n/ch1/acc/metadata", RAW_META)
        .unwrap_err();
    assert!(matches!(err, StreamError::MetadataParse(_)));
    assert!(dispatcher.registry().is_empty());
}

#[test]
fn test_wrong_stage_segment_is_protocol_error() {
    // A detrend stage fed acceleration topics has no `raw` segment to rewrite
    let mut dispatcher = Dispatcher::new(Stage::detrend());
    let err = dispatcher
        .handle_message("cpsns/s/n/ch1/acc/metadata", RAW_META)
        .unwrap_err();
    assert!(matches!(err, StreamError::Protocol(_)));
    assert_eq!(dispatcher.stats().protocol_errors, 1);
}
